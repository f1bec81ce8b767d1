use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::container::{ContainerId, ProcessId};

use super::protocol::SnoopyEvent;

/// Failed registrations kept in the status, oldest dropped first.
const MAX_FAILURES: usize = 64;

/// Registrations in flight, failed registrations and the running snoopy processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnoopyStatus {
    pub initializing: Vec<RegisterRequest>,
    /// The latest failure per container that has not been registered since.
    pub failures: Vec<RegisterFailure>,
    pub snoopy_processes: Vec<SnoopyProcess>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_id: ContainerId,
    #[serde(rename = "NsProcessId")]
    pub ns_process_pid: ProcessId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFailure {
    #[serde(flatten)]
    pub request: RegisterRequest,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnoopyProcess {
    pub pid: ProcessId,
    pub interfaces: Vec<SnoopyStatusInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnoopyStatusInterface {
    pub name: String,
    pub ingress_implementation: String,
    pub egress_implementation: String,
}

#[derive(Debug, Clone)]
pub(crate) enum StatusEvent {
    RegisterRequest(RegisterRequest),
    RegisterSuccess {
        request: RegisterRequest,
        snoopy_pid: ProcessId,
    },
    RegisterFailure(RegisterFailure),
    Remove {
        snoopy_pid: ProcessId,
    },
    Probe {
        snoopy_pid: ProcessId,
        event: SnoopyEvent,
    },
}

impl SnoopyStatus {
    fn finish_request(&mut self, request: &RegisterRequest) {
        match self.initializing.iter().position(|pending| pending == request) {
            Some(idx) => {
                self.initializing.remove(idx);
            }
            None => log::debug!(
                target: "snoopy",
                "no pending registration for container {}",
                request.container_id
            ),
        }
    }

    fn process_mut(&mut self, pid: ProcessId) -> Option<&mut SnoopyProcess> {
        self.snoopy_processes.iter_mut().find(|process| process.pid == pid)
    }

    pub(crate) fn apply(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::RegisterRequest(request) => self.initializing.push(request),
            StatusEvent::RegisterSuccess {
                request,
                snoopy_pid,
            } => {
                self.finish_request(&request);
                self.failures
                    .retain(|failure| failure.request.container_id != request.container_id);
                self.snoopy_processes.push(SnoopyProcess {
                    pid: snoopy_pid,
                    interfaces: Vec::new(),
                });
            }
            StatusEvent::RegisterFailure(failure) => {
                self.finish_request(&failure.request);
                self.failures
                    .retain(|known| known.request.container_id != failure.request.container_id);
                if self.failures.len() >= MAX_FAILURES {
                    self.failures.remove(0);
                }
                self.failures.push(failure);
            }
            StatusEvent::Remove { snoopy_pid } => {
                self.snoopy_processes.retain(|process| process.pid != snoopy_pid);
            }
            StatusEvent::Probe { snoopy_pid, event } => {
                let Some(process) = self.process_mut(snoopy_pid) else {
                    return;
                };
                match event {
                    SnoopyEvent::InterfaceAdded { interface } => {
                        process.interfaces.push(SnoopyStatusInterface {
                            name: interface.name,
                            ..Default::default()
                        });
                    }
                    SnoopyEvent::InterfaceRemoved { interface } => {
                        process.interfaces.retain(|known| known.name != interface.name);
                    }
                    SnoopyEvent::InterfaceBpfInitialized {
                        interface,
                        ingress_implementation,
                        egress_implementation,
                    } => {
                        if let Some(known) = process
                            .interfaces
                            .iter_mut()
                            .find(|known| known.name == interface)
                        {
                            known.ingress_implementation = ingress_implementation;
                            known.egress_implementation = egress_implementation;
                        }
                    }
                    SnoopyEvent::InterfaceChanged { .. }
                    | SnoopyEvent::InterfaceMetrics { .. }
                    | SnoopyEvent::InterfaceBpfInitializationFailed { .. } => {}
                }
            }
        }
    }
}

enum Message {
    Event(StatusEvent),
    Snapshot(oneshot::Sender<SnoopyStatus>),
}

/// Actor owning the [`SnoopyStatus`].
pub(crate) struct StatusTracker {
    running: AtomicBool,
    worker: Mutex<Option<mpsc::Receiver<Message>>>,
    messages: mpsc::Sender<Message>,
}

impl StatusTracker {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            running: AtomicBool::new(false),
            worker: Mutex::new(Some(rx)),
            messages: tx,
        }
    }

    fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let messages = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(messages) = messages {
            tokio::spawn(run(messages));
        }
    }

    pub(crate) fn sender(&self) -> StatusSender {
        self.start();
        StatusSender(self.messages.clone())
    }

    pub(crate) async fn status(&self) -> SnoopyStatus {
        self.start();
        let (tx, rx) = oneshot::channel();
        if self.messages.send(Message::Snapshot(tx)).await.is_err() {
            return SnoopyStatus::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// Feeds events into a [`StatusTracker`].
#[derive(Clone)]
pub(crate) struct StatusSender(mpsc::Sender<Message>);

impl StatusSender {
    pub(crate) async fn send(&self, event: StatusEvent) {
        if self.0.send(Message::Event(event)).await.is_err() {
            log::debug!(target: "snoopy", "status tracker stopped");
        }
    }
}

async fn run(mut messages: mpsc::Receiver<Message>) {
    let mut status = SnoopyStatus::default();
    while let Some(message) = messages.recv().await {
        match message {
            Message::Event(event) => status.apply(event),
            Message::Snapshot(reply) => {
                let _ = reply.send(status.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::snoopy::protocol::SnoopyInterface;

    fn request(container: &str) -> RegisterRequest {
        RegisterRequest {
            pod_namespace: "default".to_owned(),
            pod_name: "web".to_owned(),
            container_id: ContainerId::new(container).unwrap(),
            ns_process_pid: 10,
        }
    }

    fn interface(name: &str) -> SnoopyInterface {
        SnoopyInterface {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut status = SnoopyStatus::default();
        status.apply(StatusEvent::RegisterRequest(request("aaa")));
        status.apply(StatusEvent::RegisterRequest(request("bbb")));
        assert_eq!(status.initializing.len(), 2);

        status.apply(StatusEvent::RegisterSuccess {
            request: request("aaa"),
            snoopy_pid: 500,
        });
        status.apply(StatusEvent::RegisterFailure(RegisterFailure {
            request: request("bbb"),
            error: "nsenter failed".to_owned(),
        }));
        assert!(status.initializing.is_empty());
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.snoopy_processes.len(), 1);

        status.apply(StatusEvent::Remove { snoopy_pid: 500 });
        assert!(status.snoopy_processes.is_empty());
    }

    fn failure(container: &str, error: &str) -> StatusEvent {
        StatusEvent::RegisterFailure(RegisterFailure {
            request: request(container),
            error: error.to_owned(),
        })
    }

    #[test]
    fn test_failures_are_kept_per_container() {
        let mut status = SnoopyStatus::default();
        status.apply(failure("aaa", "first"));
        status.apply(failure("aaa", "second"));
        status.apply(failure("bbb", "first"));
        assert_eq!(status.failures.len(), 2);
        assert_eq!(status.failures[1].request.container_id.as_ref(), "aaa");
        assert_eq!(status.failures[1].error, "second");

        status.apply(StatusEvent::RegisterSuccess {
            request: request("bbb"),
            snoopy_pid: 7,
        });
        assert_eq!(status.failures.len(), 1);
    }

    #[test]
    fn test_failures_are_bounded() {
        let mut status = SnoopyStatus::default();
        for n in 0..MAX_FAILURES + 10 {
            status.apply(failure(&format!("c{n}"), "nsenter failed"));
        }
        assert_eq!(status.failures.len(), MAX_FAILURES);
        assert_eq!(status.failures[0].request.container_id.as_ref(), "c10");
    }

    #[test]
    fn test_probe_events_track_interfaces() {
        let mut status = SnoopyStatus::default();
        status.apply(StatusEvent::RegisterSuccess {
            request: request("aaa"),
            snoopy_pid: 500,
        });
        let probe = |event| StatusEvent::Probe {
            snoopy_pid: 500,
            event,
        };

        status.apply(probe(SnoopyEvent::InterfaceAdded {
            interface: interface("eth0"),
        }));
        status.apply(probe(SnoopyEvent::InterfaceAdded {
            interface: interface("eth1"),
        }));
        status.apply(probe(SnoopyEvent::InterfaceBpfInitialized {
            interface: "eth0".to_owned(),
            ingress_implementation: "tcx".to_owned(),
            egress_implementation: "tc".to_owned(),
        }));
        status.apply(probe(SnoopyEvent::InterfaceRemoved {
            interface: interface("eth1"),
        }));
        // Events of unknown processes are ignored.
        status.apply(StatusEvent::Probe {
            snoopy_pid: 9,
            event: SnoopyEvent::InterfaceAdded {
                interface: interface("eth9"),
            },
        });

        assert_eq!(
            status.snoopy_processes[0].interfaces,
            vec![SnoopyStatusInterface {
                name: "eth0".to_owned(),
                ingress_implementation: "tcx".to_owned(),
                egress_implementation: "tc".to_owned(),
            }]
        );
    }

    #[test]
    fn test_status_serialization() {
        let mut status = SnoopyStatus::default();
        status.apply(StatusEvent::RegisterRequest(request("aaa")));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "initializing": [{
                    "podNamespace": "default",
                    "podName": "web",
                    "containerId": "aaa",
                    "NsProcessId": 10,
                }],
                "failures": [],
                "snoopy_processes": [],
            })
        );
    }

    #[tokio::test]
    async fn test_tracker_serves_applied_events() {
        let tracker = StatusTracker::new();
        let sender = tracker.sender();
        sender.send(StatusEvent::RegisterRequest(request("aaa"))).await;
        sender
            .send(StatusEvent::RegisterSuccess {
                request: request("aaa"),
                snoopy_pid: 42,
            })
            .await;

        let status = tracker.status().await;
        assert!(status.initializing.is_empty());
        assert_eq!(status.snoopy_processes[0].pid, 42);
    }
}
