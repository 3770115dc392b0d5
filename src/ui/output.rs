use crate::analyser::containers::FlowSummary;
use crate::analyser::core::{Evaluation, FeatureRanking, TraceAnalysis};
use crate::analyser::model::ModelSet;
use ansi_term::Colour;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub fn print_header(title: &str) {
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} {title}");
}

pub fn print_trace(analysis: &TraceAnalysis) {
    print_header("Trace");
    println!("\u{2503}");
    match analysis.local_addr {
        Some(addr) => println!("\u{2503} Local endpoint   : {}", Colour::Red.paint(addr.to_string())),
        None => println!("\u{2503} Local endpoint   : {}", Colour::Red.paint("not found")),
    }
    println!("\u{2503} RTT              : {} s", Colour::Fixed(226).paint(format!("{:.4}", analysis.scale.rtt)));
    println!("\u{2503} BDP              : {} B", Colour::Fixed(226).paint(format!("{:.0}", analysis.scale.bdp)));
    println!("\u{2503} Skipped records  : {}", analysis.skipped_records);
    println!("\u{2503} ");
}

pub fn print_flow_stats(summaries: &[FlowSummary]) {
    print_header("Flows");
    for summary in summaries {
        let remote = match (summary.remote_addr, summary.remote_port) {
            (Some(addr), Some(port)) => format!("{addr}:{port}"),
            (Some(addr), None) => addr.to_string(),
            _ => "?".to_string(),
        };
        println!("\u{2503}");
        println!("\u{2503} Port {} \u{2194} {}", Colour::Red.paint(summary.port.to_string()), remote);
        println!("\u{2503} Duration         : {:.3} s ({:.3} - {:.3})", summary.duration, summary.start, summary.end);
        println!("\u{2503} Bytes in/out     : {} / {}", summary.bytes_received, summary.bytes_sent);
        println!("\u{2503} BiF samples      : {}", summary.samples);
        println!(
            "\u{2503} Retransmissions  : {} ({} B)  Dup acks: {}  OOO acks: {}",
            Colour::Fixed(226).paint(summary.retransmissions.to_string()),
            summary.retransmitted_bytes,
            summary.duplicate_acks,
            summary.out_of_order_acks
        );
    }
    println!("\u{2503} ");
}

pub fn print_fingerprints(analysis: &TraceAnalysis) {
    print_header("Fingerprints");
    for flow in &analysis.flows {
        if flow.features.is_empty() {
            continue;
        }
        println!("\u{2503}");
        println!("\u{2503} Port {}", Colour::Red.paint(flow.summary.port.to_string()));
        for feature in &flow.features {
            let coefficients: Vec<String> = feature
                .fingerprint
                .coefficients
                .iter()
                .map(|c| format!("{c:.4}"))
                .collect();
            println!(
                "\u{2503}   #{} [{}..{}] {} samples, degree {}: {}",
                feature.feature,
                feature.segment.start,
                feature.segment.end,
                feature.segment.len(),
                feature.fingerprint.degree,
                Colour::Fixed(226).paint(coefficients.join(", "))
            );
        }
    }
    println!("\u{2503} ");
}

pub fn print_rankings(rankings: &[FeatureRanking]) {
    print_header("Classification");
    for ranking in rankings {
        println!("\u{2503}");
        println!("\u{2503} Port {} feature #{}", Colour::Red.paint(ranking.port.to_string()), ranking.feature);
        if let Some(error) = &ranking.error {
            println!("\u{2503}   {}", Colour::Red.paint(error));
            continue;
        }
        for (rank, candidate) in ranking.candidates.iter().enumerate() {
            let name = if rank == 0 {
                Colour::Green.bold().paint(&candidate.cca)
            } else {
                Colour::Fixed(226).paint(&candidate.cca)
            };
            println!(
                "\u{2503}   {}. {:<12} {:>6.2}%  (log p = {:.2})",
                rank + 1,
                name,
                candidate.score * 100.0,
                candidate.log_density
            );
        }
    }
    println!("\u{2503} ");
}

pub fn print_models(models: &ModelSet) {
    print_header("Models");
    println!("\u{2503}");
    println!("\u{2503} Trained at       : {}", models.trained_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("\u{2503} Dimension        : {}", models.dimension);
    println!("\u{2503} Feature slot     : {}", models.feature_slot);
    for (cca, samples) in &models.samples {
        println!("\u{2503} {:<16} : {} samples", Colour::Fixed(226).paint(cca), samples);
    }
    println!("\u{2503} ");
}

pub fn print_confusion_matrix(evaluation: &Evaluation) {
    print_header("Evaluation");
    println!("\u{2503}");
    let header: String = evaluation.ccas.iter().map(|cca| format!("{cca:>10}")).collect();
    println!("\u{2503} {:<10}{header}{:>10}{:>10}", "truth", "errors", "acc");
    for truth in &evaluation.ccas {
        let row: String = evaluation
            .ccas
            .iter()
            .map(|predicted| format!("{:>10}", evaluation.count(truth, predicted)))
            .collect();
        let accuracy = evaluation
            .accuracy(truth)
            .map_or("NA".to_string(), |a| format!("{:.1}%", a * 100.0));
        println!(
            "\u{2503} {}{row}{:>10}{:>10}",
            Colour::Red.paint(format!("{truth:<10}")),
            evaluation.errors.get(truth).copied().unwrap_or(0),
            accuracy
        );
    }
    if let Some(overall) = evaluation.overall_accuracy() {
        println!("\u{2503}");
        println!("\u{2503} Overall accuracy : {}", Colour::Green.paint(format!("{:.1}%", overall * 100.0)));
    }
    println!("\u{2503} ");
}

pub fn data_as_json<T: Serialize>(data: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(data)
}

pub fn data_to_file(json: String, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    log::info!("Wrote {}", path.display());
    Ok(())
}
