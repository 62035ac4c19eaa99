//! REPL command handling for the node CLI
//!
//! The replicated value is a calendar: an ordered set of named entries.
//! `schedule` and `cancel` turn into insert and delete intents.

use std::collections::BTreeSet;
use std::fmt::Write;

use synod_paxos::StateStore;

use crate::driver::IntentOutcome;
use crate::node::Node;

/// Value replicated by the binary.
pub type Calendar = BTreeSet<String>;

/// REPL context holding the running node
pub struct ReplContext<S> {
    pub node: Node<Calendar, S>,
}

impl<S: StateStore<Calendar>> ReplContext<S> {
    #[must_use]
    pub fn new(node: Node<Calendar, S>) -> Self {
        Self { node }
    }

    /// Execute a REPL command
    pub async fn execute(&mut self, line: &str) -> Result<String, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            return Ok(String::new());
        };

        match command {
            "help" | "?" => Ok(Self::help()),
            "exit" | "quit" => Err("exit".to_string()),
            "show" => match parts.get(1).copied() {
                Some("calendar") => Ok(self.show_calendar()),
                Some("log") => Ok(self.show_log()),
                Some("acceptor") => Ok(self.show_acceptor()),
                Some("proposer") => Ok(self.show_proposer()),
                Some("leader") => Ok(self.show_leader()),
                Some("all") => Ok(self.show_all()),
                _ => Err("Usage: show calendar|log|acceptor|proposer|leader|all".to_string()),
            },
            "schedule" => {
                let item = entry_name(&parts[1..]).ok_or("Usage: schedule <entry>")?;
                self.cmd_schedule(item).await
            }
            "cancel" => {
                let item = entry_name(&parts[1..]).ok_or("Usage: cancel <entry>")?;
                self.cmd_cancel(item).await
            }
            _ => Err(format!(
                "Unknown command: {command}. Type 'help' for available commands."
            )),
        }
    }

    fn help() -> String {
        r"Available commands:
  show calendar        Current calendar (value at the highest committed slot)
  show log             Every committed slot
  show acceptor        Promised and accepted proposals per open slot
  show proposer        Rounds in flight
  show leader          Current leader and election state
  show all             All of the above
  schedule <entry>     Add an entry to the calendar
  cancel <entry>       Remove an entry from the calendar
  help                 Show this help
  exit                 Quit"
            .to_string()
    }

    async fn cmd_schedule(&mut self, item: String) -> Result<String, String> {
        let outcome = self
            .node
            .insert(item.clone())
            .await
            .map_err(|e| format!("Failed to schedule {item:?}: {e:?}"))?;
        Ok(describe(&item, "scheduled", outcome))
    }

    async fn cmd_cancel(&mut self, item: String) -> Result<String, String> {
        let outcome = self
            .node
            .delete(item.clone())
            .await
            .map_err(|e| format!("Failed to cancel {item:?}: {e:?}"))?;
        Ok(describe(&item, "cancelled", outcome))
    }

    fn show_calendar(&self) -> String {
        let calendar = self.node.current_value();
        if calendar.is_empty() {
            return "Calendar is empty".to_string();
        }
        let mut output = format!("Calendar ({} entries):\n", calendar.len());
        for entry in &calendar {
            let _ = writeln!(output, "  {entry}");
        }
        output.trim_end().to_string()
    }

    fn show_log(&self) -> String {
        let log = self.node.log();
        if log.is_empty() {
            return "Log is empty".to_string();
        }
        let mut output = format!("Log ({} slots):\n", log.len());
        for (slot, value) in log.iter() {
            let _ = writeln!(output, "  {slot}: {}", format_calendar(value));
        }
        output.trim_end().to_string()
    }

    fn show_acceptor(&self) -> String {
        let slots = self.node.acceptor_state();
        if slots.is_empty() {
            return "Acceptor has no slots".to_string();
        }
        let mut output = format!("Acceptor ({} slots):\n", slots.len());
        for (slot, state) in &slots {
            let promised = state
                .max_prepare
                .map_or_else(|| "-".to_string(), |n| n.to_string());
            let accepted = state.accepted.as_ref().map_or_else(
                || "-".to_string(),
                |a| format!("{} {}", a.number, format_calendar(&a.value)),
            );
            let _ = writeln!(
                output,
                "  {slot}: {} promised={promised} accepted={accepted}",
                state.phase()
            );
        }
        output.trim_end().to_string()
    }

    fn show_proposer(&self) -> String {
        let rounds = self.node.proposer_state();
        if rounds.is_empty() {
            return "No rounds in flight".to_string();
        }
        let mut output = format!("Proposer ({} rounds):\n", rounds.len());
        for (slot, round) in &rounds {
            let _ = writeln!(
                output,
                "  {slot}: number={} phase={} attempts={}",
                round.number, round.phase, round.attempts
            );
        }
        output.trim_end().to_string()
    }

    fn show_leader(&self) -> String {
        let leader = self
            .node
            .leader()
            .map_or_else(|| "unknown".to_string(), |id| id.to_string());
        format!(
            "Node {}: leader={leader} state={:?}",
            self.node.id(),
            self.node.election_state()
        )
    }

    fn show_all(&self) -> String {
        [
            self.show_leader(),
            self.show_calendar(),
            self.show_log(),
            self.show_acceptor(),
            self.show_proposer(),
        ]
        .join("\n\n")
    }
}

fn entry_name(words: &[&str]) -> Option<String> {
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

fn format_calendar(calendar: &Calendar) -> String {
    let entries: Vec<&str> = calendar.iter().map(String::as_str).collect();
    format!("{{{}}}", entries.join(", "))
}

fn describe(item: &str, verb: &str, outcome: IntentOutcome) -> String {
    match outcome {
        IntentOutcome::Committed { slot } => format!("{item:?} {verb} (slot {slot})"),
        IntentOutcome::Forwarded { leader } => {
            format!("{item:?} forwarded to leader {leader}")
        }
    }
}
