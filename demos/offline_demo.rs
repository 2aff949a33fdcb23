//! Demonstration of the ecg-sonify analysis chain without a sensor.
//!
//! This example shows how to:
//! 1. Generate a synthetic ECG and heart-rate stream
//! 2. Batch frames into window pairs
//! 3. Extract QRS durations, RR intervals and peak amplitudes
//! 4. Map the features to per-layer playback events
//! 5. Play them through the logging engine for a few seconds
//!
//! Run with: cargo run --example offline_demo
//! Add RUST_LOG=ecg_sonify=debug to see every trigger fire.

use std::sync::Arc;
use std::time::Duration;

use ecg_sonify::{
    core::{analyze_window, AnalysisConfig, Mapper, MappingConfig, ReportBuilder, WindowManager},
    playback::{LogEngine, PlaybackConfig, PlaybackScheduler, TerminationPolicy},
    sensor::simulated::{SimulatedConfig, SyntheticEcg},
    stats::SessionStats,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ecg_sonify=info")),
        )
        .init();

    println!("ecg-sonify - Offline Demo");
    println!("=========================");
    println!();

    let mut generator = SyntheticEcg::new(SimulatedConfig {
        realtime: false,
        ..SimulatedConfig::default()
    });
    let mut window_manager = WindowManager::new(10);
    let analysis_config = AnalysisConfig::default();
    let mapper = Mapper::new(MappingConfig::default());
    let reports = ReportBuilder::new();
    let stats = SessionStats::new();

    println!("Session ID: {}", reports.session_id());
    println!("Generating 30 seconds of synthetic ECG...");
    println!();

    let mut last_sequences = Vec::new();
    for _ in 0..30 {
        let frame = generator.next_frame();
        stats.record_ecg_frame();
        stats.record_hr_frame();
        window_manager.process_frame(frame.ecg);
        window_manager.process_frame(frame.heart_rate);

        for pair in window_manager.take_completed_windows() {
            let analysis = analyze_window(&pair, &analysis_config);
            let report = reports.build(&pair, &analysis);
            stats.record_window(
                analysis.features.qrs_durations.len() as u64,
                report.is_empty(),
            );

            println!("Window {} complete:", pair.sequence);
            println!(
                "  Peaks: R={} Q={} S={}",
                report.peaks.r, report.peaks.q, report.peaks.s
            );
            if let Some(ref qrs) = report.qrs_secs {
                println!(
                    "  QRS duration: {:.3}s mean over {} complexes",
                    qrs.mean, qrs.count
                );
            }
            if let Some(bpm) = report.heart_rate_bpm {
                println!("  Heart rate: {bpm:.1} bpm");
            }

            let sequences = mapper.map(&analysis.features);
            for (layer, events) in &sequences {
                println!("  {layer}: {} events", events.len());
            }
            println!();
            last_sequences = sequences;
        }
    }

    println!("Playing the last window for 5 seconds...");
    let mut scheduler = PlaybackScheduler::new(
        Arc::new(LogEngine::new()),
        PlaybackConfig {
            policy: TerminationPolicy::Wrap,
            ..PlaybackConfig::default()
        },
    );
    if let Err(e) = scheduler.start() {
        eprintln!("Error starting playback: {e}");
        return;
    }
    let scheduled = scheduler.schedule(last_sequences);
    stats.record_events_scheduled(scheduled as u64);
    std::thread::sleep(Duration::from_secs(5));
    scheduler.stop();

    println!();
    println!("{}", stats.summary());
    println!();
    println!("Demo complete!");
}
