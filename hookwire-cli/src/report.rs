//! Report generation
//!
//! Summarises a finished scenario run as plain text or JSON.

use crate::scenario::ScenarioRunner;
use hookwire_core::{CallbackId, TimerState, Value};
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub scenario: String,
    pub steps: usize,
    pub elapsed_ms: u64,
    pub drains: usize,
    pub tasks_executed: usize,
    pub tasks_failed: usize,
    pub callbacks_live: usize,
    pub pending_tasks: usize,
    pub host_schedules: usize,
    pub host_cancels: usize,
    pub handlers: Vec<HandlerSummary>,
    pub timers: Vec<TimerSummary>,
    pub buses: Vec<String>,
    pub warnings: usize,
    pub errors: usize,
    pub log: Vec<ReportLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerSummary {
    pub name: String,
    pub id: CallbackId,
    pub registered: bool,
    pub calls: u32,
    pub last_args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerSummary {
    pub name: String,
    pub id: CallbackId,
    pub state: TimerState,
    pub delivered: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportLine {
    pub level: String,
    pub text: String,
}

impl Report {
    /// Snapshot the runner's state; call before shutting it down
    pub fn from_runner(runner: &ScenarioRunner) -> Self {
        let dispatcher = &runner.dispatcher;

        let handlers = runner
            .handler_ids
            .iter()
            .map(|(name, id)| {
                let stats = runner.handler_stats(name);
                HandlerSummary {
                    name: name.clone(),
                    id: *id,
                    registered: dispatcher.is_live(*id),
                    calls: stats.calls,
                    last_args: stats.last_args,
                }
            })
            .collect();

        let timers = runner
            .timers
            .iter()
            .map(|(name, timer)| TimerSummary {
                name: name.clone(),
                id: timer.id(),
                state: timer.state(),
                delivered: runner.timer_deliveries(name),
            })
            .collect();

        let lines: Vec<ReportLine> = runner
            .sink
            .lines()
            .into_iter()
            .map(|line| ReportLine {
                level: line.level.to_string(),
                text: line.text,
            })
            .collect();

        let (host_schedules, host_cancels) = runner.host.requests();

        Self {
            scenario: runner
                .config()
                .name
                .clone()
                .unwrap_or_else(|| "unnamed".to_string()),
            steps: runner.steps_run,
            elapsed_ms: runner.host.now_ms(),
            drains: runner.totals.drains,
            tasks_executed: runner.totals.executed,
            tasks_failed: runner.totals.failed,
            callbacks_live: dispatcher.callback_count(),
            pending_tasks: dispatcher.pending_tasks(),
            host_schedules,
            host_cancels,
            handlers,
            timers,
            buses: dispatcher.bus_names(),
            warnings: runner.sink.count(log::Level::Warn),
            errors: runner.sink.count(log::Level::Error),
            log: lines,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_txt(&self) -> String {
        let mut out = String::new();
        let rule = "═".repeat(47);
        let thin = "─".repeat(47);

        // Writing into a String cannot fail.
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "  Scenario: {}", self.scenario);
        let _ = writeln!(out, "{}\n", rule);

        let _ = writeln!(out, "Steps:          {}", self.steps);
        let _ = writeln!(out, "Simulated time: {}ms", self.elapsed_ms);
        let _ = writeln!(out, "Drains:         {}", self.drains);
        let _ = writeln!(
            out,
            "Tasks:          {} executed, {} failed",
            self.tasks_executed, self.tasks_failed
        );
        let _ = writeln!(
            out,
            "Left over:      {} callback(s), {} pending task(s)",
            self.callbacks_live, self.pending_tasks
        );
        let _ = writeln!(
            out,
            "Host timers:    {} scheduled, {} cancelled",
            self.host_schedules, self.host_cancels
        );

        if !self.handlers.is_empty() {
            let _ = writeln!(out, "\nHandlers\n{}", thin);
            for handler in &self.handlers {
                let _ = writeln!(
                    out,
                    "  {:<20} {:>6}  calls={:<4} {}  last={}",
                    handler.name,
                    handler.id.to_string(),
                    handler.calls,
                    if handler.registered { "live" } else { "gone" },
                    Value::List(handler.last_args.clone())
                );
            }
        }

        if !self.timers.is_empty() {
            let _ = writeln!(out, "\nTimers\n{}", thin);
            for timer in &self.timers {
                let _ = writeln!(
                    out,
                    "  {:<20} {:>6}  {:<8} delivered={}",
                    timer.name,
                    timer.id.to_string(),
                    timer.state.to_string(),
                    timer.delivered
                );
            }
        }

        if !self.buses.is_empty() {
            let _ = writeln!(out, "\nBuses: {}", self.buses.join(", "));
        }

        let _ = writeln!(
            out,
            "\nLog ({} warning(s), {} error(s))\n{}",
            self.warnings, self.errors, thin
        );
        if self.log.is_empty() {
            let _ = writeln!(out, "  (empty)");
        }
        for line in &self.log {
            let _ = writeln!(out, "  [{}] {}", line.level, line.text);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn finished_run() -> Report {
        let config: AppConfig = toml::from_str(
            r#"
            name = "report-demo"

            [[handlers]]
            name = "tick"

            [[handlers]]
            name = "broken"
            kind = "fail"

            [[timers]]
            name = "heartbeat"
            handler = "tick"
            interval_ms = 50
            repeat = 2

            [[steps]]
            action = "advance"
            ms = 200

            [[steps]]
            action = "invoke"
            handler = "broken"

            [[steps]]
            action = "invoke_id"
            id = 77
            "#,
        )
        .unwrap();
        let mut runner = ScenarioRunner::new(config).unwrap();
        runner.run().unwrap();
        Report::from_runner(&runner)
    }

    #[test]
    fn test_report_collects_run_state() {
        let report = finished_run();

        assert_eq!(report.scenario, "report-demo");
        assert_eq!(report.steps, 3);
        assert_eq!(report.elapsed_ms, 200);
        assert_eq!(report.tasks_executed, 2);
        assert_eq!(report.warnings, 1);
        assert_eq!(report.errors, 1);
        assert_eq!((report.host_schedules, report.host_cancels), (1, 1));

        let tick = report.handlers.iter().find(|h| h.name == "tick").unwrap();
        assert_eq!(tick.calls, 2);
        assert_eq!(report.timers[0].state, TimerState::Dead);
        assert_eq!(report.timers[0].delivered, 2);
    }

    #[test]
    fn test_txt_rendering() {
        let text = finished_run().render_txt();
        assert!(text.contains("Scenario: report-demo"));
        assert!(text.contains("heartbeat"));
        assert!(text.contains("1 warning(s), 1 error(s)"));
        assert!(text.contains("failed on purpose"));
    }

    #[test]
    fn test_json_rendering() {
        let json = finished_run().to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["scenario"], "report-demo");
        assert_eq!(parsed["timers"][0]["state"], "dead");
        assert_eq!(parsed["handlers"][0]["name"], "broken");
    }
}
