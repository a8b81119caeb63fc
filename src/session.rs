//! Per-connection task: protocol phases, URB relay, and teardown.
//!
//! Each accepted socket gets one task running [`run`]. The task
//! multiplexes four event sources: decoded inbound frames, URB
//! completions from the backend, the server shutdown signal, and a
//! housekeeping tick for URB deadlines and idle timeouts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::backend::{
    CompletionSink, Direction, TransferKind, UrbCompletion, UrbRequest, UsbBackend,
};
use crate::bindings::BindingStore;
use crate::claim::{ClaimManager, ClaimedDevice, ConnectionId};
use crate::codec::{
    self, DecodeLimits, Decoder, Inbound, OpRequest, Phase, RetSubmitReply, SubmitFrame,
    UnlinkFrame,
};
use crate::device::{Busid, DeviceRegistry, UsbDevice};
use crate::error::{Error, Result};
use crate::proto;
use crate::tracker::{CancelState, InFlightUrb, UrbTracker};

/// Depth of the per-connection completion channel. A full channel blocks
/// backend delivery for this connection only.
const COMPLETION_QUEUE_DEPTH: usize = 32;
/// Depth of the outbound byte queue feeding the writer task.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Server-side collaborators a session works against.
pub struct Shared {
    pub backend: Arc<dyn UsbBackend>,
    pub registry: Arc<DeviceRegistry>,
    pub bindings: Arc<BindingStore>,
    pub claims: Arc<ClaimManager>,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub urb_timeout: Duration,
    pub idle_timeout: Duration,
    pub limits: DecodeLimits,
}

struct Session {
    id: ConnectionId,
    shared: Arc<Shared>,
    params: SessionParams,
    decoder: Decoder,
    tracker: UrbTracker,
    claim: Option<ClaimedDevice>,
    outbound: mpsc::Sender<Vec<u8>>,
    completions: CompletionSink,
    last_activity: Instant,
}

/// Drive one connection to completion. All errors are connection-scoped;
/// this function never panics the server.
pub async fn run<S>(
    id: ConnectionId,
    stream: S,
    peer: String,
    shared: Arc<Shared>,
    params: SessionParams,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!(conn = id, peer = %peer, "client connected");

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    let (completion_tx, mut completion_rx) = mpsc::channel(COMPLETION_QUEUE_DEPTH);
    let mut session = Session {
        id,
        shared,
        decoder: Decoder::new(params.limits),
        params,
        tracker: UrbTracker::new(),
        claim: None,
        outbound: out_tx,
        completions: completion_tx,
        last_activity: Instant::now(),
    };

    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut read_buf = vec![0u8; 16 * 1024];

    let outcome: Result<()> = loop {
        tokio::select! {
            read = read_half.read(&mut read_buf) => {
                match read {
                    Ok(0) => break Err(Error::Disconnect),
                    Ok(n) => {
                        session.last_activity = Instant::now();
                        if let Err(e) = session.on_bytes(&read_buf[..n]).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e.into()),
                }
            }
            Some(completion) = completion_rx.recv() => {
                if let Err(e) = session.on_completion(completion).await {
                    break Err(e);
                }
            }
            _ = shutdown.changed() => {
                debug!(conn = id, "shutdown signalled");
                break Ok(());
            }
            _ = sweep.tick() => {
                if let Err(e) = session.on_tick().await {
                    break Err(e);
                }
            }
        }
    };

    match &outcome {
        Ok(()) => debug!(conn = id, "session closing on shutdown"),
        Err(Error::Disconnect) => debug!(conn = id, "peer disconnected"),
        Err(Error::Timeout) => info!(conn = id, "connection idle, closing"),
        Err(e) => warn!(conn = id, error = %e, "session error"),
    }

    session.teardown().await;
    // Let queued replies drain, but never hang on a stuck peer.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    info!(conn = id, peer = %peer, "client gone");
}

impl Session {
    async fn on_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.decoder.feed(bytes);
        while let Some(frame) = self.decoder.next_frame()? {
            match frame {
                Inbound::Op(op) => self.on_op(op).await?,
                Inbound::Submit(frame) => self.on_submit(frame).await?,
                Inbound::Unlink(frame) => self.on_unlink(frame).await?,
            }
        }
        Ok(())
    }

    async fn on_op(&mut self, op: OpRequest) -> Result<()> {
        match op {
            OpRequest::Devlist => {
                let exported = self.exported_devices().await;
                debug!(conn = self.id, count = exported.len(), "devlist requested");
                self.send(codec::encode_devlist_reply(&exported)).await
            }
            OpRequest::Import { busid } => self.on_import(&busid).await,
        }
    }

    /// Present ∩ bound, in busid order.
    async fn exported_devices(&self) -> Vec<UsbDevice> {
        let registry = &self.shared.registry;
        let snapshot = match registry.refresh(&self.shared.backend).await {
            Ok(devices) => devices,
            Err(e) => {
                // Enumeration hiccups are retryable; serve the last
                // known snapshot rather than dropping the connection.
                warn!(conn = self.id, error = %e, "device scan failed, using cached snapshot");
                registry.snapshot()
            }
        };
        let bound = self.shared.bindings.bound_set();
        snapshot
            .into_iter()
            .filter(|dev| bound.contains(&dev.busid.to_string()))
            .collect()
    }

    async fn on_import(&mut self, raw_busid: &str) -> Result<()> {
        let Ok(busid) = raw_busid.parse::<Busid>() else {
            debug!(conn = self.id, busid = raw_busid, "import of unparseable busid");
            return self.send(codec::encode_import_failure()).await;
        };

        // Freshen presence before the claim decision.
        if let Err(e) = self.shared.registry.refresh(&self.shared.backend).await {
            warn!(conn = self.id, error = %e, "device scan failed before import");
        }

        match self.shared.claims.claim(busid, self.id).await {
            Ok(claim) => {
                info!(conn = self.id, busid = %busid, "device imported");
                let reply = codec::encode_import_success(&claim.device);
                self.claim = Some(claim);
                self.decoder.set_phase(Phase::Urb);
                self.send(reply).await
            }
            Err(e) => {
                debug!(conn = self.id, busid = %busid, error = %e, "import refused");
                self.send(codec::encode_import_failure()).await
            }
        }
    }

    async fn on_submit(&mut self, frame: SubmitFrame) -> Result<()> {
        let claim = self
            .claim
            .as_ref()
            .ok_or(Error::IllegalMessage {
                phase: "op",
                got: "CMD_SUBMIT",
            })?
            .clone();

        let ep = frame.ep as u8;
        if !claim.device.has_endpoint(ep) {
            debug!(conn = self.id, seqnum = frame.seqnum, ep, "submit to undeclared endpoint");
            return self
                .send_ret_submit_error(frame.seqnum, proto::EPIPE)
                .await;
        }

        // Direction was validated by the decoder.
        let direction = Direction::from_wire(frame.direction)
            .ok_or(Error::Protocol(codec::CodecError::MalformedField("direction")))?;
        let kind = if ep == 0 {
            TransferKind::Control
        } else if frame.is_iso() {
            TransferKind::Isochronous
        } else if frame.interval > 0 {
            TransferKind::Interrupt
        } else {
            TransferKind::Bulk
        };

        let in_flight = InFlightUrb {
            seqnum: frame.seqnum,
            endpoint: ep,
            direction,
            kind,
            setup: frame.setup,
            requested_length: frame.buffer_length,
            submitted_at: Instant::now(),
            cancel_requested: false,
        };
        // A reused live seqnum would corrupt correlation for the rest of
        // the connection; treat it as a protocol violation.
        self.tracker
            .register(in_flight)
            .map_err(|dup| Error::DuplicateSeqnum(dup.0))?;

        let request = UrbRequest {
            seqnum: frame.seqnum,
            endpoint: ep,
            direction,
            kind,
            setup: frame.setup,
            buffer_length: frame.buffer_length,
            out_data: frame.out_data,
            iso_packets: frame.iso_packets,
            interval: frame.interval,
            start_frame: frame.start_frame,
            flags: frame.transfer_flags,
        };
        trace!(conn = self.id, seqnum = request.seqnum, ep, "urb submitted");

        let submit = self
            .shared
            .backend
            .submit(claim.handle, request, self.completions.clone())
            .await;
        if let Err(e) = submit {
            self.tracker.take(frame.seqnum);
            warn!(conn = self.id, seqnum = frame.seqnum, error = %e, "backend submit failed");
            return self
                .send_ret_submit_error(frame.seqnum, e.wire_status())
                .await;
        }
        Ok(())
    }

    async fn on_unlink(&mut self, frame: UnlinkFrame) -> Result<()> {
        let claim = self
            .claim
            .as_ref()
            .ok_or(Error::IllegalMessage {
                phase: "op",
                got: "CMD_UNLINK",
            })?
            .clone();

        let status = match self.tracker.request_cancel(frame.victim) {
            CancelState::Pending => {
                debug!(conn = self.id, victim = frame.victim, "unlink pending urb");
                if let Err(e) = self.shared.backend.cancel(claim.handle, frame.victim).await {
                    warn!(conn = self.id, victim = frame.victim, error = %e, "backend cancel failed");
                }
                0
            }
            CancelState::AlreadyCompleted => proto::ECONNRESET,
        };
        // RET_UNLINK goes out immediately and may precede the victim's
        // own RET_SUBMIT.
        self.send(codec::encode_ret_unlink(frame.seqnum, status)).await
    }

    async fn on_completion(&mut self, completion: UrbCompletion) -> Result<()> {
        let Some(urb) = self.tracker.take(completion.seqnum) else {
            // Already timed out, unlinked past the point of reply, or
            // drained. Exactly-once delivery: drop it.
            trace!(conn = self.id, seqnum = completion.seqnum, "late completion discarded");
            return Ok(());
        };

        let data = if urb.direction == Direction::In {
            completion.data.as_slice()
        } else {
            &[]
        };
        let reply = RetSubmitReply {
            seqnum: completion.seqnum,
            status: completion.status,
            actual_length: completion.actual_length,
            start_frame: completion.start_frame,
            number_of_packets: completion.iso_packets.len() as u32,
            error_count: completion.error_count,
            data,
            iso_packets: &completion.iso_packets,
        };
        trace!(
            conn = self.id,
            seqnum = completion.seqnum,
            status = completion.status,
            "urb completed"
        );
        self.send(codec::encode_ret_submit(&reply)).await
    }

    async fn on_tick(&mut self) -> Result<()> {
        // Read inactivity. A connection quietly waiting on in-flight
        // URBs (an idle keyboard, say) is not idle.
        if self.tracker.is_empty() && self.last_activity.elapsed() >= self.params.idle_timeout {
            return Err(Error::Timeout);
        }

        let expired = self
            .tracker
            .mark_expired(Instant::now(), self.params.urb_timeout);
        for seqnum in expired {
            // The deadline reply wins; a late real completion will miss
            // in the tracker and be discarded.
            if self.tracker.take(seqnum).is_none() {
                continue;
            }
            warn!(conn = self.id, seqnum, "urb deadline exceeded");
            if let Some(claim) = &self.claim {
                if let Err(e) = self.shared.backend.cancel(claim.handle, seqnum).await {
                    warn!(conn = self.id, seqnum, error = %e, "backend cancel failed");
                }
            }
            self.send_ret_submit_error(seqnum, proto::ETIME).await?;
        }
        Ok(())
    }

    async fn send_ret_submit_error(&self, seqnum: u32, status: i32) -> Result<()> {
        self.send(codec::encode_ret_submit(&RetSubmitReply {
            seqnum,
            status,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data: &[],
            iso_packets: &[],
        }))
        .await
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| Error::Disconnect)
    }

    /// Cancel whatever is still in flight and give the claim back.
    async fn teardown(mut self) {
        let drained = self.tracker.drain();
        if let Some(claim) = self.claim.take() {
            for urb in &drained {
                if let Err(e) = self.shared.backend.cancel(claim.handle, urb.seqnum).await {
                    debug!(conn = self.id, seqnum = urb.seqnum, error = %e, "teardown cancel failed");
                }
            }
            self.shared.claims.release(claim.device.busid).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockBackend, ScriptedFailure};
    use crate::backend::sim::{demo_device, SimBackend};
    use crate::backend::DeviceHandle;
    use crate::config::MemStore;
    use crate::endian::BeU32;
    use crate::proto::*;

    fn params() -> SessionParams {
        SessionParams {
            urb_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            limits: DecodeLimits::default(),
        }
    }

    struct Harness {
        client: tokio::io::DuplexStream,
        shared: Arc<Shared>,
        sim: Arc<SimBackend>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn spawn_session(bind: bool) -> Harness {
        let busid = Busid::new(1, 1);
        let sim = Arc::new(SimBackend::with_devices([demo_device(busid)]));
        let backend: Arc<dyn UsbBackend> = sim.clone();
        let registry = Arc::new(DeviceRegistry::new());
        registry.refresh(&backend).await.unwrap();
        let bindings = Arc::new(BindingStore::open(Arc::new(MemStore::default())).unwrap());
        if bind {
            bindings.bind(busid).unwrap();
        }
        let claims = Arc::new(ClaimManager::new(
            backend.clone(),
            registry.clone(),
            bindings.clone(),
        ));
        let shared = Arc::new(Shared {
            backend,
            registry,
            bindings,
            claims,
        });

        let (client, server_end) = tokio::io::duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            1,
            server_end,
            "test".to_string(),
            shared.clone(),
            params(),
            shutdown_rx,
        ));
        Harness {
            client,
            shared,
            sim,
            shutdown_tx,
            task,
        }
    }

    async fn read_exact(client: &mut tokio::io::DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf
    }

    fn import_request(busid: &str) -> Vec<u8> {
        let mut bytes = bytemuck::bytes_of(&OpHeader::new(OP_REQ_IMPORT, 0)).to_vec();
        let mut field = [0u8; BUSID_LEN];
        field[..busid.len()].copy_from_slice(busid.as_bytes());
        bytes.extend_from_slice(&field);
        bytes
    }

    fn submit(seqnum: u32, direction: u32, ep: u32, len: u32, setup: [u8; 8]) -> Vec<u8> {
        let cmd = CmdSubmit {
            header: UrbHeader::new(CMD_SUBMIT, seqnum, 0x0001_0001, direction, ep),
            transfer_flags: BeU32::ZERO,
            transfer_buffer_length: BeU32::new(len),
            start_frame: BeU32::ZERO,
            number_of_packets: BeU32::new(0xffff_ffff),
            interval: BeU32::ZERO,
            setup,
        };
        bytemuck::bytes_of(&cmd).to_vec()
    }

    #[tokio::test]
    async fn import_then_control_transfer() {
        let mut h = spawn_session(true).await;

        h.client.write_all(&import_request("1-1")).await.unwrap();
        let reply = read_exact(&mut h.client, 8 + 312).await;
        assert_eq!(&reply[2..4], &[0x00, 0x03]);
        assert_eq!(&reply[4..8], &[0, 0, 0, 0]);
        assert_eq!(&reply[8 + 300..8 + 302], &[0x05, 0xac]);

        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        h.client.write_all(&submit(1, DIR_IN, 0, 18, setup)).await.unwrap();
        let ret = read_exact(&mut h.client, 48 + 18).await;
        assert_eq!(&ret[..4], &[0, 0, 0, 3]);
        assert_eq!(&ret[4..8], &[0, 0, 0, 1]);
        assert_eq!(&ret[20..24], &[0, 0, 0, 0]);
        assert_eq!(&ret[24..28], &[0, 0, 0, 18]);

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn unbound_import_keeps_connection_open() {
        let mut h = spawn_session(false).await;

        h.client.write_all(&import_request("1-1")).await.unwrap();
        let reply = read_exact(&mut h.client, 8).await;
        assert_eq!(&reply[4..8], &[0, 0, 0, 1]);

        // Still in the op phase: a devlist request works.
        h.client
            .write_all(bytemuck::bytes_of(&OpHeader::new(OP_REQ_DEVLIST, 0)))
            .await
            .unwrap();
        let devlist = read_exact(&mut h.client, 12).await;
        assert_eq!(&devlist[8..12], &[0, 0, 0, 0]);

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn urb_before_import_closes_without_reply() {
        let mut h = spawn_session(true).await;

        h.client
            .write_all(&submit(1, DIR_IN, 0, 18, [0; 8]))
            .await
            .unwrap();
        // Connection closes with nothing written.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), h.client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_seqnum_closes_connection() {
        let mut h = spawn_session(true).await;

        h.client.write_all(&import_request("1-1")).await.unwrap();
        read_exact(&mut h.client, 8 + 312).await;

        // Park the endpoint so the first submit stays in flight.
        h.sim.park_endpoint(&Busid::new(1, 1), 1);
        h.client.write_all(&submit(7, DIR_IN, 1, 8, [0; 8])).await.unwrap();
        h.client.write_all(&submit(7, DIR_IN, 1, 8, [0; 8])).await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), h.client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        // Cancelled-on-teardown RET_SUBMIT for seqnum 7 may precede the
        // close, but nothing else.
        assert!(rest.len() % 48 == 0);
        h.task.await.unwrap();

        // The claim was given back.
        assert_eq!(h.shared.claims.claimed_count(), 0);
    }

    #[tokio::test]
    async fn unlink_race_yields_one_ret_each() {
        let mut h = spawn_session(true).await;

        h.client.write_all(&import_request("1-1")).await.unwrap();
        read_exact(&mut h.client, 8 + 312).await;

        h.sim.park_endpoint(&Busid::new(1, 1), 1);
        h.client
            .write_all(&submit(0x42, DIR_IN, 1, 8, [0; 8]))
            .await
            .unwrap();

        let unlink = CmdUnlink {
            header: UrbHeader::new(CMD_UNLINK, 0x43, 0x0001_0001, 0, 0),
            unlink_seqnum: BeU32::new(0x42),
            padding: [0; 24],
        };
        h.client
            .write_all(bytemuck::bytes_of(&unlink))
            .await
            .unwrap();

        // Two 48-byte replies: RET_UNLINK (status 0) and the victim's
        // RET_SUBMIT (cancelled), in either order.
        let first = read_exact(&mut h.client, 48).await;
        let second = read_exact(&mut h.client, 48).await;
        let mut saw_unlink = 0;
        let mut saw_submit = 0;
        for ret in [&first, &second] {
            match ret[3] {
                4 => {
                    saw_unlink += 1;
                    assert_eq!(&ret[4..8], &[0, 0, 0, 0x43]);
                    assert_eq!(&ret[20..24], &[0, 0, 0, 0]);
                }
                3 => {
                    saw_submit += 1;
                    assert_eq!(&ret[4..8], &[0, 0, 0, 0x42]);
                    assert_eq!(&ret[20..24], &[0xff, 0xff, 0xff, 0x98]);
                }
                other => panic!("unexpected command {other}"),
            }
        }
        assert_eq!((saw_unlink, saw_submit), (1, 1));

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_and_releases() {
        let mut h = spawn_session(true).await;

        h.client.write_all(&import_request("1-1")).await.unwrap();
        read_exact(&mut h.client, 8 + 312).await;

        h.sim.park_endpoint(&Busid::new(1, 1), 1);
        for seq in 1..=5u32 {
            h.client
                .write_all(&submit(seq, DIR_IN, 1, 8, [0; 8]))
                .await
                .unwrap();
        }
        // Give the session a beat to register all five.
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(h.client);
        h.task.await.unwrap();

        let mut cancelled = h.sim.cancel_log();
        cancelled.sort_unstable();
        assert_eq!(cancelled, vec![1, 2, 3, 4, 5]);
        assert_eq!(h.shared.claims.claimed_count(), 0);
        assert_eq!(h.sim.claim_count(), 0);
    }

    struct MockHarness {
        client: tokio::io::DuplexStream,
        mock: Arc<MockBackend>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn spawn_mock_session() -> MockHarness {
        let busid = Busid::new(1, 1);
        let mock = Arc::new(MockBackend::with_devices([demo_device(busid)]));
        let backend: Arc<dyn UsbBackend> = mock.clone();
        let registry = Arc::new(DeviceRegistry::new());
        registry.refresh(&backend).await.unwrap();
        let bindings = Arc::new(BindingStore::open(Arc::new(MemStore::default())).unwrap());
        bindings.bind(busid).unwrap();
        let claims = Arc::new(ClaimManager::new(
            backend.clone(),
            registry.clone(),
            bindings.clone(),
        ));
        let shared = Arc::new(Shared {
            backend,
            registry,
            bindings,
            claims,
        });

        let (client, server_end) = tokio::io::duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            2,
            server_end,
            "test".to_string(),
            shared,
            params(),
            shutdown_rx,
        ));
        MockHarness {
            client,
            mock,
            shutdown_tx,
            task,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn mock_completion_flows_to_ret_submit() {
        let mut h = spawn_mock_session().await;

        h.client.write_all(&import_request("1-1")).await.unwrap();
        read_exact(&mut h.client, 8 + 312).await;

        h.client.write_all(&submit(5, DIR_IN, 1, 4, [0; 8])).await.unwrap();
        let mock = h.mock.clone();
        wait_until(move || mock.pending_seqnums() == vec![5]).await;

        // First claim on the mock hands out handle 1.
        let handle = DeviceHandle(1);
        assert!(
            h.mock
                .complete(handle, UrbCompletion::success(5, vec![0xde, 0xad]))
                .await
        );

        let ret = read_exact(&mut h.client, 48 + 2).await;
        assert_eq!(&ret[..4], &[0, 0, 0, 3]);
        assert_eq!(&ret[4..8], &[0, 0, 0, 5]);
        assert_eq!(&ret[20..24], &[0, 0, 0, 0]);
        assert_eq!(&ret[24..28], &[0, 0, 0, 2]);
        assert_eq!(&ret[48..], &[0xde, 0xad]);

        // Resolved means gone: a second completion has nowhere to land.
        assert!(
            !h.mock
                .complete(handle, UrbCompletion::success(5, Vec::new()))
                .await
        );

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn unlink_race_through_mock_backend() {
        let mut h = spawn_mock_session().await;

        h.client.write_all(&import_request("1-1")).await.unwrap();
        read_exact(&mut h.client, 8 + 312).await;

        h.client
            .write_all(&submit(0x42, DIR_IN, 1, 8, [0; 8]))
            .await
            .unwrap();
        let mock = h.mock.clone();
        wait_until(move || mock.pending_seqnums() == vec![0x42]).await;

        let unlink = CmdUnlink {
            header: UrbHeader::new(CMD_UNLINK, 0x43, 0x0001_0001, 0, 0),
            unlink_seqnum: BeU32::new(0x42),
            padding: [0; 24],
        };
        h.client
            .write_all(bytemuck::bytes_of(&unlink))
            .await
            .unwrap();

        // Exactly one RET_UNLINK (status 0) and one cancelled RET_SUBMIT,
        // in either order.
        let first = read_exact(&mut h.client, 48).await;
        let second = read_exact(&mut h.client, 48).await;
        let mut saw_unlink = 0;
        let mut saw_submit = 0;
        for ret in [&first, &second] {
            match ret[3] {
                4 => {
                    saw_unlink += 1;
                    assert_eq!(&ret[4..8], &[0, 0, 0, 0x43]);
                    assert_eq!(&ret[20..24], &[0, 0, 0, 0]);
                }
                3 => {
                    saw_submit += 1;
                    assert_eq!(&ret[4..8], &[0, 0, 0, 0x42]);
                    assert_eq!(&ret[20..24], &[0xff, 0xff, 0xff, 0x98]);
                }
                other => panic!("unexpected command {other}"),
            }
        }
        assert_eq!((saw_unlink, saw_submit), (1, 1));

        // The cancel reached the backend and nothing is left in flight.
        assert!(h.mock.calls().contains(&Call::Cancel(0x42)));
        assert!(h.mock.pending_seqnums().is_empty());

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn devlist_serves_cached_snapshot_when_scan_fails() {
        let mut h = spawn_mock_session().await;
        let devlist_req = bytemuck::bytes_of(&OpHeader::new(OP_REQ_DEVLIST, 0)).to_vec();

        h.client.write_all(&devlist_req).await.unwrap();
        let header = read_exact(&mut h.client, 12).await;
        assert_eq!(&header[8..12], &[0, 0, 0, 1]);
        // Device record plus its one interface record.
        read_exact(&mut h.client, 312 + 4).await;

        // A transient scan failure must not drop the connection; the
        // cached snapshot still answers.
        h.mock
            .set_enumerate_failure(Some(ScriptedFailure::Unavailable));
        h.client.write_all(&devlist_req).await.unwrap();
        let header = read_exact(&mut h.client, 12).await;
        assert_eq!(&header[8..12], &[0, 0, 0, 1]);
        let record = read_exact(&mut h.client, 312 + 4).await;
        assert_eq!(trim_padded(&record[256..288]), "1-1");

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }
}
