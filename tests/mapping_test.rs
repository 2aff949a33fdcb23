//! Integration tests from window samples to trigger fires

use ecg_sonify::core::{
    analyze_window, midi_to_frequency, AnalysisConfig, FeatureSet, FrameWindow, Layer, Mapper,
    MappingConfig, WindowPair,
};
use ecg_sonify::playback::{
    EngineCall, MemoryEngine, Step, TerminationPolicy, Trigger, TriggerState, TriggerStatus,
};
use ecg_sonify::sensor::Frame;
use std::sync::Arc;
use std::time::Duration;

/// Q at 40, R at 50, S at 65 over a flat baseline.
fn clean_cycle() -> Vec<f64> {
    let mut samples = vec![0.0; 100];
    samples[40] = -200.0;
    for i in 41..50 {
        samples[i] = -200.0 + (i - 40) as f64 * 200.0;
    }
    samples[50] = 2000.0;
    for i in 51..65 {
        samples[i] = 2000.0 - (i - 50) as f64 * 160.0;
    }
    samples[65] = -400.0;
    samples
}

fn intervals(state: &mut TriggerState, fires: usize) -> Vec<Option<f64>> {
    (0..fires)
        .map(|_| match state.update() {
            Step::Fire(event) | Step::Last(event) => Some(event.interval_secs),
            Step::Exhausted => None,
        })
        .collect()
}

fn assert_close(actual: &[Option<f64>], expected: &[Option<f64>]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        match (a, e) {
            (Some(a), Some(e)) => assert!((a - e).abs() < 1e-9, "{a} != {e}"),
            (None, None) => {}
            _ => panic!("{actual:?} != {expected:?}"),
        }
    }
}

#[test]
fn test_clean_cycle_maps_to_one_tonal_event() {
    let pair = WindowPair {
        sequence: 0,
        ecg: FrameWindow {
            frames: vec![Frame::ecg(2_000_000_000, clean_cycle())],
        },
        hr: FrameWindow::default(),
    };
    let analysis = analyze_window(&pair, &AnalysisConfig::default());
    assert_eq!(analysis.features.qrs_durations, vec![0.5]);

    let mapper = Mapper::new(MappingConfig::default());
    let tonal = mapper.tonal_events(&analysis.features.qrs_durations);
    assert_eq!(tonal.len(), 1);
    assert_eq!(tonal[0].symbol, Some(65));
    assert_eq!(tonal[0].frequency_hz, Some(midi_to_frequency(65)));
}

#[test]
fn test_gong_sequence_under_both_policies() {
    let mapper = Mapper::new(MappingConfig::default());
    let features = FeatureSet {
        rr_intervals: vec![0.9, 0.8, 1.2],
        ..FeatureSet::default()
    };
    let gong = mapper
        .map(&features)
        .into_iter()
        .find(|(layer, _)| *layer == Layer::Gong)
        .map(|(_, events)| events)
        .unwrap();

    let mut halting = TriggerState::new(gong.clone(), TerminationPolicy::HaltAtEnd);
    assert_close(
        &intervals(&mut halting, 4),
        &[Some(4.4), Some(4.3), Some(4.7), None],
    );
    assert_eq!(halting.status(), TriggerStatus::Exhausted);

    let mut wrapping = TriggerState::new(gong, TerminationPolicy::Wrap);
    assert_close(
        &intervals(&mut wrapping, 4),
        &[Some(4.4), Some(4.3), Some(4.7), Some(4.4)],
    );
}

#[test]
fn test_empty_features_map_to_empty_layers() {
    let mapper = Mapper::new(MappingConfig::default());
    let sequences = mapper.map(&FeatureSet::default());
    assert_eq!(sequences.len(), 4);
    assert!(sequences.iter().all(|(_, events)| events.is_empty()));
}

#[test]
fn test_halting_trigger_releases_once() {
    let mapper = Mapper::new(MappingConfig::default());
    let gong = mapper.gong_events(&[0.9, 0.8, 1.2]);
    let engine = Arc::new(MemoryEngine::new());

    // Tempo 100 turns 4.4 s into 44 ms.
    let mut trigger = Trigger::spawn(
        Layer::Gong,
        TriggerState::new(gong, TerminationPolicy::HaltAtEnd),
        engine.clone(),
        100.0,
    )
    .unwrap();

    assert!(engine.wait_until(Duration::from_secs(5), |calls| {
        calls.contains(&EngineCall::Release(Layer::Gong))
    }));
    trigger.stop();
    trigger.stop();

    assert!(trigger.is_finished());
    assert_eq!(engine.plays(Layer::Gong), 3);
    assert_eq!(engine.releases(Layer::Gong), 1);
}
