use std::io::{self, Write};

use serde::Serialize;

use crate::app::{InitResult, ProgressEvent, ProgressSink, PurgeResult, StatusResult};
use crate::sampler::{FetchReport, StopReason};
use crate::sync::SyncReport;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sync(result: &SyncReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_purge(result: &PurgeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_init(result: &InitResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Prints progress lines to stderr so stdout stays clean for summaries.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{CYAN}·{RESET} {} ({elapsed:.1?})", event.message),
            None => eprintln!("{CYAN}·{RESET} {}", event.message),
        }
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_fetch(result: &FetchReport) {
        println!("{CYAN}Fetch summary{RESET}");
        println!(
            "{GREEN}Saved observations: {}/{}{RESET}",
            result.succeeded, result.target
        );
        println!("{YELLOW}Skipped duplicates: {}{RESET}", result.skipped_duplicate);
        println!("{RED}Failed attempts: {}{RESET}", result.failed);
        println!("Attempts used: {}/{}", result.attempts, result.budget);
        print_stop(&result.stop, result.is_partial());
    }

    pub fn print_sync(result: &SyncReport) {
        println!("{CYAN}Sync summary{RESET}");
        if let Some(scheme) = result.scheme {
            println!("Auth scheme: {scheme}");
        }
        println!("Observations considered: {}", result.considered);
        println!("{GREEN}Tasks created: {}{RESET}", result.created);
        println!("{YELLOW}Skipped existing tasks: {}{RESET}", result.skipped_duplicate);
        println!("{RED}Rejected: {}{RESET}", result.rejected);
        println!("{RED}Failed: {}{RESET}", result.failed);
        print_stop(&result.stop, false);
    }

    pub fn print_status(result: &StatusResult) {
        println!("{CYAN}Database:{RESET} {}", result.database_path);
        println!("{CYAN}Images:{RESET} {}", result.image_dir);
        println!("Observations: {}", result.observations);
        println!("Synced: {}", result.synced);
        println!("Unsynced: {}", result.unsynced);
        println!("Image files: {}", result.image_files);
        for stage in &result.labels {
            println!("  {:<8} {}", stage.life_stage.as_str(), stage.count);
        }
    }

    pub fn print_purge(result: &PurgeResult) {
        println!(
            "{GREEN}Deleted {} observations, {} labels, {} synced tasks and {} images{RESET}",
            result.observations, result.labels, result.synced_tasks, result.images_removed
        );
    }

    pub fn print_init(result: &InitResult) {
        println!("{GREEN}Database ready at {}{RESET}", result.database_path);
        println!("{GREEN}Images stored in {}{RESET}", result.image_dir);
    }
}

fn print_stop(stop: &StopReason, partial: bool) {
    match stop {
        StopReason::Completed if partial => {
            println!("{YELLOW}Stopped early{RESET}");
        }
        StopReason::Completed => println!("{GREEN}Completed{RESET}"),
        StopReason::BudgetExhausted => {
            println!("{YELLOW}Partial: attempt budget exhausted{RESET}");
        }
        StopReason::CatalogExhausted => {
            println!("{YELLOW}Partial: no more candidates in the catalog{RESET}");
        }
        StopReason::Aborted { message, .. } => println!("{RED}Aborted: {message}{RESET}"),
    }
}
