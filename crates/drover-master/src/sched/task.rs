//! Per-call response aggregation.
//!
//! A task is created at dispatch time with a report skeleton already
//! holding one slot per selected minion. Responses arriving on any pipe
//! are pushed in through [`TaskHandle::notify`]; the executor fills the
//! pre-allocated slot so the final report preserves selection order, not
//! arrival order.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::debug;

use drover_core::{CallResponse, Error, Report, ReportItem, Result, ResultType};

/// One minion's response routed from the event loop into a task.
#[derive(Debug)]
pub(crate) struct TaskPack {
    pub name: String,
    pub call: CallResponse,
}

/// The scheduler-table half of a task: just the notify channel.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    tx: mpsc::UnboundedSender<TaskPack>,
}

impl TaskHandle {
    /// Routes a response into the task. Dropped silently when the
    /// executor already finished — the call is over either way.
    pub fn notify(&self, name: &str, call: CallResponse) {
        let _ = self.tx.send(TaskPack {
            name: name.to_string(),
            call,
        });
    }
}

/// The caller-owned half: accumulates packs until complete or deadline.
pub(crate) struct TaskExecutor {
    total: u32,
    gets: u32,
    rx: mpsc::UnboundedReceiver<TaskPack>,
    report: Report,
    index: HashMap<String, usize>,
}

/// Creates a task from its pre-populated report skeleton.
///
/// `index` maps each selected minion name to its slot in
/// `report.items`.
pub(crate) fn new_task(report: Report, index: HashMap<String, usize>) -> (TaskHandle, TaskExecutor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let total = report.total;
    (
        TaskHandle { tx },
        TaskExecutor {
            total,
            gets: 0,
            rx,
            report,
            index,
        },
    )
}

impl TaskExecutor {
    /// Runs the accumulation loop until `gets == total` or the deadline.
    ///
    /// Returns the report in both cases; on deadline the partially-filled
    /// slots remain and the error half carries `timeout`.
    pub async fn execute(mut self, deadline: Duration) -> (Report, Result<()>) {
        if self.total == 0 {
            return (self.report, Ok(()));
        }

        let until = Instant::now() + deadline;
        loop {
            match timeout_at(until, self.rx.recv()).await {
                Err(_) => {
                    return (
                        self.report,
                        Err(Error::timeout(format!(
                            "call deadline exceeded with {}/{} responses",
                            self.gets, self.total
                        ))),
                    );
                }
                // All senders dropped: the scheduler is shutting down.
                Ok(None) => {
                    return (self.report, Err(Error::unavailable("scheduler stopped")));
                }
                Ok(Some(pack)) => {
                    self.fill(pack);
                    if self.gets >= self.total {
                        return (self.report, Ok(()));
                    }
                }
            }
        }
    }

    fn fill(&mut self, pack: TaskPack) {
        let idx = match self.index.get(pack.name.as_str()) {
            Some(idx) => *idx,
            None => {
                // Response from a minion that was not in the selection;
                // append rather than lose it.
                debug!(minion = %pack.name, "response from unselected minion");
                self.index.insert(pack.name.clone(), self.report.items.len());
                self.report.items.push(ReportItem::pending(&pack.name));
                self.report.items.len() - 1
            }
        };

        let item = &mut self.report.items[idx];
        item.error = pack.call.error;
        item.data = pack.call.result;
        item.result = pack.call.result_type == ResultType::Ok;
        self.gets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skeleton(names: &[&str]) -> (Report, HashMap<String, usize>) {
        let mut report = Report::default();
        let mut index = HashMap::new();
        for name in names {
            index.insert((*name).to_string(), report.items.len());
            report.items.push(ReportItem::pending(*name));
        }
        report.total = names.len() as u32;
        (report, index)
    }

    fn ok_response(id: u64, data: &[u8]) -> CallResponse {
        CallResponse {
            id,
            result_type: ResultType::Ok,
            ret_code: 0,
            result: data.to_vec(),
            error: String::new(),
        }
    }

    #[tokio::test]
    async fn completes_when_all_slots_fill() {
        let (report, index) = skeleton(&["m1", "m2"]);
        let (handle, executor) = new_task(report, index);

        handle.notify("m2", ok_response(1, b"two"));
        handle.notify("m1", ok_response(1, b"one"));

        let (report, outcome) = executor.execute(Duration::from_secs(5)).await;
        outcome.unwrap();

        // Selection order, not arrival order.
        assert_eq!(report.items[0].minion, "m1");
        assert_eq!(report.items[0].data, b"one");
        assert!(report.items[0].result);
        assert_eq!(report.items[1].minion, "m2");
        assert_eq!(report.items[1].data, b"two");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_returns_timeout_with_partial_report() {
        let (report, index) = skeleton(&["m1", "m2"]);
        let (handle, executor) = new_task(report, index);

        handle.notify("m1", ok_response(1, b"one"));

        let (report, outcome) = executor.execute(Duration::from_secs(2)).await;
        assert!(outcome.unwrap_err().is_timeout());
        assert!(report.items[0].result);
        assert!(!report.items[1].result);
        assert!(report.items[1].error.is_empty());
    }

    #[tokio::test]
    async fn error_responses_fill_slot_without_success() {
        let (report, index) = skeleton(&["m1"]);
        let (handle, executor) = new_task(report, index);

        handle.notify(
            "m1",
            CallResponse {
                id: 1,
                result_type: ResultType::Error,
                ret_code: 127,
                result: Vec::new(),
                error: "command not found".to_string(),
            },
        );

        let (report, outcome) = executor.execute(Duration::from_secs(5)).await;
        outcome.unwrap();
        assert!(!report.items[0].result);
        assert_eq!(report.items[0].error, "command not found");
    }

    #[tokio::test]
    async fn unknown_minion_appends_instead_of_dropping() {
        let (report, index) = skeleton(&["m1"]);
        let (handle, executor) = new_task(report, index);

        handle.notify("stranger", ok_response(1, b"??"));

        let (report, outcome) = executor.execute(Duration::from_secs(5)).await;
        outcome.unwrap();
        assert_eq!(report.items.len(), 2);
        assert_eq!(report.items[1].minion, "stranger");
    }

    #[tokio::test]
    async fn empty_selection_completes_immediately() {
        let (report, index) = skeleton(&[]);
        let (_handle, executor) = new_task(report, index);
        let (report, outcome) = executor.execute(Duration::from_secs(5)).await;
        outcome.unwrap();
        assert!(report.items.is_empty());
    }
}
