// Rich terminal output for converge

use std::io::IsTerminal;
use std::time::Duration;

use colored::*;

use super::{status_of, Recap, Reporter};
use crate::executor::RunResult;
use crate::parser::ast::{Play, Task};

/// Colored, human-readable progress on stdout
pub struct TerminalReporter {
    verbose: bool,
}

impl TerminalReporter {
    pub fn new(verbose: bool) -> Self {
        // Respect NO_COLOR environment variable (https://no-color.org/)
        // Also disable colors if not a TTY
        if std::env::var("NO_COLOR").is_ok() || !std::io::stdout().is_terminal() {
            colored::control::set_override(false);
        }

        TerminalReporter { verbose }
    }

    fn print_result_body(&self, result: &RunResult) {
        let output = &result.output;

        if let Some(error) = output.error() {
            println!("      {}", error.red());
            return;
        }

        match output.summary() {
            Some("") => {}
            Some(summary) => println!("      {}", summary.dimmed()),
            None if self.verbose => {
                for (key, value) in output.entries() {
                    let text = value.to_string();
                    if text.is_empty() {
                        continue;
                    }
                    println!("      {}:", key.bold());
                    for line in text.lines() {
                        println!("        {}", line.dimmed());
                    }
                }
            }
            None => {}
        }
    }

    fn print_recap(&self, title: &str, history: &[RunResult]) {
        let recap = Recap::from_history(history);
        let total: Duration = history.iter().map(|r| r.runtime).sum();

        let changed = if recap.changed > 0 {
            format!("changed={}", recap.changed).yellow()
        } else {
            format!("changed={}", recap.changed).normal()
        };
        let failed = if recap.failed > 0 {
            format!("failed={}", recap.failed).red().bold()
        } else {
            format!("failed={}", recap.failed).normal()
        };

        println!();
        println!("{}", title.green().bold());
        println!("{}", "─".repeat(60).dimmed());
        println!(
            "{}    {}    {}",
            format!("ok={}", recap.ok).green(),
            changed,
            failed
        );
        println!("Task time: {:.2}s", total.as_secs_f64());
    }
}

impl Reporter for TerminalReporter {
    fn start_play(&self, play: &Play) {
        println!();
        println!("{} {}", "PLAY".green().bold(), play.name.cyan());
        println!("{}", "─".repeat(60).dimmed());
    }

    fn start_task(&self, task: &Task, name: &str, args: &str) {
        println!();
        if self.verbose && !args.is_empty() {
            println!(
                "{} {} {}",
                "TASK".yellow().bold(),
                name,
                format!("({} {})", task.command, args).dimmed()
            );
        } else {
            println!("{} {}", "TASK".yellow().bold(), name);
        }
    }

    fn finish_task(&self, result: &RunResult) {
        let status = match status_of(result) {
            "failed" => "FAILED".red().bold(),
            "changed" => "CHANGED".yellow(),
            _ => "OK".green(),
        };

        println!(
            "  {} {} {} {}",
            status,
            "=>".dimmed(),
            result.task.name.white().bold(),
            format!("[{:.2}s]", result.runtime.as_secs_f64()).dimmed()
        );

        self.print_result_body(result);
    }

    fn finish_tasks(&self, history: &[RunResult]) {
        self.print_recap("TASK RECAP", history);
    }

    fn start_handlers(&self) {
        println!();
        println!("{}", "RUNNING HANDLERS".green().bold());
    }

    fn finish_handlers(&self, history: &[RunResult]) {
        self.print_recap("RUN RECAP", history);
    }
}
