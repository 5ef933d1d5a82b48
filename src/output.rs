use crate::runner::BatchSummary;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print the batch summary in the specified format
pub fn print_summary(summary: &BatchSummary, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print_plain(summary),
        OutputFormat::Json => print_json(summary),
    }
}

fn print_plain(summary: &BatchSummary) {
    println!("=== Batch Summary ===");
    println!("Matches completed: {}", summary.completed);
    if summary.interrupted {
        println!("Batch was interrupted before all matches finished.");
    }
    println!();

    print_category_counts("Parse misses", &summary.parse_misses);
    print_category_counts("Order-swap inconsistencies", &summary.inconsistencies);
}

fn print_category_counts(
    title: &str,
    counts: &std::collections::BTreeMap<String, usize>,
) {
    println!("{}", title);
    println!("{}", "-".repeat(title.len()));
    if counts.is_empty() {
        println!("none");
    } else {
        for (category, count) in counts {
            println!("{:<15} {}", category, count);
        }
    }
    println!();
}

fn print_json(summary: &BatchSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing summary to JSON: {}", e),
    }
}
