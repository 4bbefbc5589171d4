//! Pull flow: approve, then pipe bytes both ways until either side ends.

use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::{
    ClientInput, ClientSink, GatewayError, Relay, SessionContext, UpstreamEvent, UpstreamExec,
};
use crate::approval::ApprovalRequest;
use crate::git::ExecCommand;

/// Upstream stream errors that routinely show up when a fetch finishes and
/// are not worth surfacing.
const BENIGN_DISCONNECTS: &[&str] = &["early EOF", "unexpected disconnect"];

fn is_benign_disconnect(error: &GatewayError) -> bool {
    match error {
        GatewayError::Upstream(message) => {
            BENIGN_DISCONNECTS.iter().any(|pattern| message.contains(pattern))
        }
        _ => false,
    }
}

impl Relay {
    #[instrument(skip_all, fields(phase = "PullFlow", repository = %exec.target.repository()))]
    pub(crate) async fn run_pull(
        &self,
        exec: &ExecCommand,
        session: &SessionContext,
        input: &mut mpsc::Receiver<ClientInput>,
        sink: &mut dyn ClientSink,
    ) -> Result<u32, GatewayError> {
        let request = ApprovalRequest::pull(exec.target.repository(), session.identity.clone());
        self.approve(request).await?;

        let mut upstream = self.connect_upstream(exec, session).await?;
        let result = pipe(&mut *upstream, input, sink).await;
        upstream.close().await;
        result
    }
}

/// Copy client input upstream and upstream output to the client.  Returns
/// the upstream exit status once the upstream channel closes.
async fn pipe(
    upstream: &mut dyn UpstreamExec,
    input: &mut mpsc::Receiver<ClientInput>,
    sink: &mut dyn ClientSink,
) -> Result<u32, GatewayError> {
    let mut exit = None;
    let mut client_open = true;

    loop {
        tokio::select! {
            message = input.recv(), if client_open => match message {
                Some(ClientInput::Data(chunk)) => upstream.send(&chunk).await?,
                Some(ClientInput::Eof) => {
                    upstream.send_eof().await?;
                    client_open = false;
                }
                None => return Err(GatewayError::ClientDisconnected),
            },
            event = upstream.recv() => match event {
                Ok(Some(UpstreamEvent::Data(chunk))) => sink.data(&chunk).await?,
                Ok(Some(UpstreamEvent::Stderr(chunk))) => sink.stderr(&chunk).await?,
                Ok(Some(UpstreamEvent::ExitStatus(status))) => exit = Some(status),
                Ok(Some(UpstreamEvent::Eof)) => {}
                Ok(None) => break,
                Err(e) if is_benign_disconnect(&e) => {
                    debug!(error = %e, "ignoring benign upstream disconnect");
                    break;
                }
                Err(e) => return Err(e),
            },
        }
    }
    Ok(exit.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use bytes::Bytes;

    use super::*;
    use crate::approval::RequestMethod;
    use crate::git::pktline::tests::{pkt, sample_advertisement};
    use crate::relay::testing::{
        client_input, relay, session, FakeConnector, FakeGate, RecordingSink, Step,
    };
    use crate::relay::RelayLimits;

    const PULL: &str = "git-upload-pack 'github.com/acme/widgets.git'";

    fn data(bytes: &[u8]) -> Step {
        Step::Emit(UpstreamEvent::Data(Bytes::copy_from_slice(bytes)))
    }

    fn upload_pack_script(tail: Vec<Step>) -> Vec<Step> {
        let mut script = vec![data(&sample_advertisement()), Step::AwaitClientEof];
        script.extend(tail);
        script
    }

    #[tokio::test]
    async fn test_pull_pipes_bytes_in_order() {
        let chunks: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 1000 + i as usize]).collect();
        let mut tail: Vec<Step> = chunks.iter().map(|c| data(c)).collect();
        tail.push(Step::Emit(UpstreamEvent::Stderr(Bytes::from_static(
            b"Counting objects: 5, done.\n",
        ))));
        tail.push(Step::Emit(UpstreamEvent::ExitStatus(0)));
        let connector = FakeConnector::new(upload_pack_script(tail));
        let gate = FakeGate::allowing();
        let relay = relay(connector.clone(), gate.clone(), RelayLimits::default());

        let wants = pkt(b"want 1111111111111111111111111111111111111111\n");
        let mut input = client_input(&[&wants, b"0000", b"0009done\n"]);
        let mut sink = RecordingSink::default();
        let status = relay
            .run_command(PULL, &session(), &mut input, &mut sink)
            .await;

        assert_eq!(status, 0);
        let mut expected = sample_advertisement();
        for chunk in &chunks {
            expected.extend_from_slice(chunk);
        }
        assert_eq!(sink.stdout_bytes(), expected);
        assert_eq!(sink.stderr_text(), "Counting objects: 5, done.\n");

        let mut sent = wants.clone();
        sent.extend_from_slice(b"00000009done\n");
        assert_eq!(connector.written(), sent);
        assert_eq!(connector.log.eof_sent.load(Ordering::SeqCst), 1);

        let requests = gate.requests.lock().unwrap();
        assert_eq!(requests[0].method, RequestMethod::Get);
        assert!(requests[0].pack.is_none());
    }

    #[tokio::test]
    async fn test_pull_propagates_exit_status() {
        let connector = FakeConnector::new(upload_pack_script(vec![
            Step::Emit(UpstreamEvent::Stderr(Bytes::from_static(
                b"fatal: repository not found\n",
            ))),
            Step::Emit(UpstreamEvent::ExitStatus(128)),
            Step::Emit(UpstreamEvent::Eof),
        ]));
        let relay = relay(connector, FakeGate::allowing(), RelayLimits::default());

        let mut input = client_input(&[]);
        let mut sink = RecordingSink::default();
        let status = relay
            .run_command(PULL, &session(), &mut input, &mut sink)
            .await;
        assert_eq!(status, 128);
        assert_eq!(sink.exit_status(), Some(128));
        assert_eq!(sink.stderr_text(), "fatal: repository not found\n");
    }

    #[tokio::test]
    async fn test_pull_swallows_benign_disconnect() {
        let connector = FakeConnector::new(upload_pack_script(vec![
            data(b"PACK-tail"),
            Step::Fail(GatewayError::Upstream("early EOF".into())),
        ]));
        let relay = relay(connector, FakeGate::allowing(), RelayLimits::default());

        let mut input = client_input(&[]);
        let mut sink = RecordingSink::default();
        let status = relay
            .run_command(PULL, &session(), &mut input, &mut sink)
            .await;
        assert_eq!(status, 0);
        assert!(sink.stderr_text().is_empty());
        assert!(sink.stdout_bytes().ends_with(b"PACK-tail"));
    }

    #[tokio::test]
    async fn test_pull_surfaces_other_upstream_errors() {
        let connector = FakeConnector::new(upload_pack_script(vec![Step::Fail(
            GatewayError::Upstream("connection reset by peer".into()),
        )]));
        let relay = relay(connector, FakeGate::allowing(), RelayLimits::default());

        let mut input = client_input(&[]);
        let mut sink = RecordingSink::default();
        let status = relay
            .run_command(PULL, &session(), &mut input, &mut sink)
            .await;
        assert_eq!(status, 1);
        assert_eq!(
            sink.stderr_text(),
            "upstream error: connection reset by peer\n"
        );
    }

    #[tokio::test]
    async fn test_blocked_pull_never_dials() {
        let connector = FakeConnector::new(upload_pack_script(vec![]));
        let relay = relay(
            connector.clone(),
            FakeGate::blocking("repository is embargoed"),
            RelayLimits::default(),
        );

        let mut input = client_input(&[]);
        let mut sink = RecordingSink::default();
        let status = relay
            .run_command(PULL, &session(), &mut input, &mut sink)
            .await;
        assert_eq!(status, 1);
        assert_eq!(sink.stderr_text(), "Access denied: repository is embargoed\n");
        assert_eq!(connector.dials(), 0);
    }

    #[tokio::test]
    async fn test_gate_unavailable_fails_closed() {
        let connector = FakeConnector::new(upload_pack_script(vec![]));
        let relay = relay(
            connector.clone(),
            FakeGate::with(Err(GatewayError::ApprovalUnavailable(
                "gate returned 503".into(),
            ))),
            RelayLimits::default(),
        );

        let mut input = client_input(&[]);
        let mut sink = RecordingSink::default();
        assert_eq!(
            relay
                .run_command(PULL, &session(), &mut input, &mut sink)
                .await,
            1
        );
        assert_eq!(connector.dials(), 0);
        assert!(sink.stderr_text().contains("gate returned 503"));
    }

    #[test]
    fn test_benign_patterns() {
        assert!(is_benign_disconnect(&GatewayError::Upstream(
            "fetch-pack: early EOF".into()
        )));
        assert!(is_benign_disconnect(&GatewayError::Upstream(
            "unexpected disconnect while reading sideband packet".into()
        )));
        assert!(!is_benign_disconnect(&GatewayError::Upstream(
            "host key mismatch".into()
        )));
        assert!(!is_benign_disconnect(&GatewayError::Timeout(
            "early EOF".into()
        )));
    }
}
