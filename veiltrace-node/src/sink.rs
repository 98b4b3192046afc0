use tracing::info;
use veiltrace_core::{EventRef, EventSink, RegistryEvent};

/// Writes the event feed into the log stream under the `veiltrace::events`
/// target.
#[derive(Clone, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: RegistryEvent) -> anyhow::Result<()> {
        let reference = match &event.reference {
            EventRef::Subject(subject) => subject.to_string(),
            EventRef::Session(session) => session.to_string(),
            EventRef::Request(request) => request.to_string(),
        };
        info!(
            target: "veiltrace::events",
            kind = ?event.kind,
            reference = %reference,
            principal = %event.principal,
            at_ms = event.at_ms,
            "registry event"
        );
        Ok(())
    }
}
