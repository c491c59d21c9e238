//! Coverage server: lets several fuzzer instances pool coverage,
//! corpus samples, and crashes over a small framed TCP protocol.
//! Push-pull only; the server never calls back into a client.

use crate::config::Config;
use crate::crash::{sanitize_crash_name, CrashManager, MAX_IDENTICAL_CRASHES};
use anyhow::{bail, Context};
use bytes::{BufMut, BytesMut};
use magpie_core::codec::{read_bytes, read_u32, read_u64, write_bytes, write_u64};
use magpie_core::coverage::Coverage;
use magpie_core::sample::Sample;
use magpie_core::MAX_SAMPLE_SIZE;
use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

pub const PROTOCOL_MAGIC: u32 = 0x4d41_4753;
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8771";

const CMD_REPORT_COVERAGE: u8 = 1;
const CMD_REPORT_CRASH: u8 = 2;
const CMD_GET_UPDATES: u8 = 3;

/// Requests are mostly one sample plus a coverage set; anything bigger
/// than this is a protocol violation.
const MAX_REQUEST: usize = 1 << 28;

/// Client half. One request per connection.
pub struct CoverageClient {
    addr: String,
    /// High-water mark of server samples already pulled.
    num_server_samples: u64,
}

impl CoverageClient {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            num_server_samples: 0,
        }
    }

    fn send_request(&self, cmd: u8, payload: &[u8]) -> anyhow::Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.addr)
            .with_context(|| format!("failed to connect to coverage server {}", self.addr))?;
        let mut frame = BytesMut::with_capacity(payload.len() + 16);
        frame.put_u32_le(PROTOCOL_MAGIC);
        frame.put_u8(cmd);
        frame.put_u64_le(payload.len() as u64);
        frame.put_slice(payload);
        stream.write_all(&frame).context("failed to send request")?;
        Ok(stream)
    }

    /// Report coverage, optionally with the sample that produced it.
    /// Coverage without a sample is recorded by the server but never
    /// distributed.
    pub fn report_new_coverage(
        &mut self,
        coverage: &Coverage,
        sample: Option<&Sample>,
    ) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        coverage.write_to(&mut payload)?;
        match sample {
            Some(s) => {
                payload.push(1);
                write_bytes(&mut payload, s.bytes())?;
            }
            None => payload.push(0),
        }
        let mut stream = self.send_request(CMD_REPORT_COVERAGE, &payload)?;
        expect_ack(&mut stream)
    }

    pub fn report_crash(&mut self, sample: &Sample, name: &str) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        write_bytes(&mut payload, name.as_bytes())?;
        write_bytes(&mut payload, sample.bytes())?;
        let mut stream = self.send_request(CMD_REPORT_CRASH, &payload)?;
        expect_ack(&mut stream)
    }

    /// Pull samples this instance has not seen yet; `total_execs` lets
    /// the server report fleet progress.
    pub fn get_updates(
        &mut self,
        server_samples: &mut VecDeque<Sample>,
        total_execs: u64,
    ) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        write_u64(&mut payload, self.num_server_samples)?;
        write_u64(&mut payload, total_execs)?;
        let mut stream = self.send_request(CMD_GET_UPDATES, &payload)?;
        let count = read_u64(&mut stream)?;
        for _ in 0..count {
            let bytes = read_bytes(&mut stream, MAX_SAMPLE_SIZE)?;
            server_samples.push_back(Sample::new(bytes));
            self.num_server_samples += 1;
        }
        Ok(())
    }
}

fn expect_ack(stream: &mut TcpStream) -> anyhow::Result<()> {
    let magic = read_u32(stream).context("missing server ack")?;
    if magic != PROTOCOL_MAGIC {
        bail!("bad server ack");
    }
    Ok(())
}

#[derive(Default)]
struct ServerState {
    coverage: Coverage,
    samples: Vec<Sample>,
}

pub struct CoverageServer {
    config: Config,
    state: Mutex<ServerState>,
    crashes: CrashManager,
}

impl CoverageServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(ServerState::default()),
            crashes: CrashManager::new(MAX_IDENTICAL_CRASHES),
        }
    }

    pub fn handle_connection(&self, stream: &mut TcpStream) -> anyhow::Result<()> {
        let magic = read_u32(stream).context("failed to read request")?;
        if magic != PROTOCOL_MAGIC {
            bail!("bad request magic {:#x}", magic);
        }
        let mut cmd = [0u8; 1];
        stream.read_exact(&mut cmd)?;
        let payload = read_bytes(stream, MAX_REQUEST)?;
        let mut payload = Cursor::new(payload);

        match cmd[0] {
            CMD_REPORT_COVERAGE => self.on_report_coverage(&mut payload, stream),
            CMD_REPORT_CRASH => self.on_report_crash(&mut payload, stream),
            CMD_GET_UPDATES => self.on_get_updates(&mut payload, stream),
            other => bail!("unknown command {}", other),
        }
    }

    fn on_report_coverage(
        &self,
        payload: &mut Cursor<Vec<u8>>,
        stream: &mut TcpStream,
    ) -> anyhow::Result<()> {
        let coverage = Coverage::read_from(payload).context("bad coverage payload")?;
        let mut has_sample = [0u8; 1];
        payload.read_exact(&mut has_sample)?;
        let sample = if has_sample[0] == 1 {
            Some(Sample::new(read_bytes(payload, MAX_SAMPLE_SIZE)?))
        } else {
            None
        };

        {
            let mut state = self.state.lock().unwrap();
            let new = coverage.difference(&state.coverage);
            state.coverage.merge(&new);
            if let Some(sample) = sample {
                // retain for distribution only if the client brought
                // offsets the pool had not seen
                if !new.is_empty() {
                    let index = state.samples.len() as u64;
                    sample
                        .save(self.config.sample_path(index))
                        .context("failed to persist pooled sample")?;
                    log::info!(
                        "pooled sample {:05} with {} new offsets",
                        index,
                        new.num_offsets()
                    );
                    state.samples.push(sample);
                }
            }
        }
        send_ack(stream)
    }

    fn on_report_crash(
        &self,
        payload: &mut Cursor<Vec<u8>>,
        stream: &mut TcpStream,
    ) -> anyhow::Result<()> {
        let name = String::from_utf8(read_bytes(payload, 4096)?)
            .context("crash name is not valid utf-8")?;
        let sample = Sample::new(read_bytes(payload, MAX_SAMPLE_SIZE)?);
        if let Some(duplicate) = self.crashes.register(&name) {
            let filename = format!("{}_{}", sanitize_crash_name(&name), duplicate);
            sample
                .save(self.config.crash_dir().join(&filename))
                .context("failed to persist pooled crash")?;
            log::info!("pooled crash {}", filename);
        }
        send_ack(stream)
    }

    fn on_get_updates(
        &self,
        payload: &mut Cursor<Vec<u8>>,
        stream: &mut TcpStream,
    ) -> anyhow::Result<()> {
        let since = read_u64(payload)?;
        let client_execs = read_u64(payload)?;

        let state = self.state.lock().unwrap();
        let since = (since as usize).min(state.samples.len());
        let fresh = &state.samples[since..];
        log::info!(
            "client at {} execs, sending {} sample(s)",
            client_execs,
            fresh.len()
        );

        let mut response = Vec::new();
        write_u64(&mut response, fresh.len() as u64)?;
        for sample in fresh {
            write_bytes(&mut response, sample.bytes())?;
        }
        stream
            .write_all(&response)
            .context("failed to send updates")?;
        Ok(())
    }
}

fn send_ack(stream: &mut TcpStream) -> anyhow::Result<()> {
    stream
        .write_all(&PROTOCOL_MAGIC.to_le_bytes())
        .context("failed to send ack")
}

/// Run only the coverage server, until the process is terminated.
pub fn run_server(config: Config) -> anyhow::Result<()> {
    let addr = config
        .server_addr
        .clone()
        .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());
    for dir in [config.sample_dir(), config.crash_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let listener = TcpListener::bind(&addr)
        .with_context(|| format!("failed to bind coverage server to {}", addr))?;
    log::info!("coverage server listening on {}", addr);

    let server = Arc::new(CoverageServer::new(config));
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let server = Arc::clone(&server);
                std::thread::spawn(move || {
                    if let Err(e) = server.handle_connection(&mut stream) {
                        log::warn!("connection error: {}", e);
                    }
                });
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[test]
    fn client_server_round_trip() {
        let out_dir =
            std::env::temp_dir().join(format!("magpie_server_{}", std::process::id()));
        let _ = fs::remove_dir_all(&out_dir);
        let config = Config {
            out_dir,
            timeout: Duration::from_secs(1),
            ..Config::default()
        };
        fs::create_dir_all(config.sample_dir()).unwrap();
        fs::create_dir_all(config.crash_dir()).unwrap();

        let server = Arc::new(CoverageServer::new(config.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let served = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for _ in 0..4 {
                let (mut stream, _) = listener.accept().unwrap();
                served.handle_connection(&mut stream).unwrap();
            }
        });

        let mut client = CoverageClient::new(addr);
        let mut coverage = Coverage::new();
        coverage.insert("t", 1);
        coverage.insert("t", 2);
        let sample = Sample::new(b"pooled".to_vec());

        client.report_new_coverage(&coverage, Some(&sample)).unwrap();
        // the same offsets again must not retain another sample
        client.report_new_coverage(&coverage, Some(&sample)).unwrap();
        client
            .report_crash(&Sample::new(b"boom".to_vec()), "SIGSEGV_y")
            .unwrap();

        let mut updates = VecDeque::new();
        client.get_updates(&mut updates, 123).unwrap();
        handle.join().unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].bytes(), b"pooled");
        assert!(config.sample_path(0).exists());
        assert!(config.crash_dir().join("SIGSEGV_y_1").exists());
        assert_eq!(server.crashes.num_unique_crashes(), 1);
        assert_eq!(server.state.lock().unwrap().samples.len(), 1);

        let _ = fs::remove_dir_all(&config.out_dir);
    }
}
