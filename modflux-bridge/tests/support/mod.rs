//! Test fixtures: a simulated Modbus TCP server and a capturing sink.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use modflux_bridge::registry::Endpoint;
use modflux_common::Sample;
use modflux_influx::{PointSink, SinkError};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const READ_INPUT_REGISTERS: u8 = 0x04;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Default)]
struct SimState {
    banks: Mutex<HashMap<u8, HashMap<u16, u16>>>,
    exception_units: Mutex<HashSet<u8>>,
    delay: Mutex<Duration>,
    stalled: AtomicBool,
    short: AtomicBool,
    connections: AtomicUsize,
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A Modbus TCP server answering "read input registers" from in-memory banks.
///
/// Unset registers read as zero. Every unit id is served.
pub struct SimServer {
    addr: SocketAddr,
    state: Arc<SimState>,
    task: JoinHandle<()>,
}

impl SimServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(SimState::default());

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state, task }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_registers(&self, unit: u8, start: u16, words: &[u16]) {
        let mut banks = self.state.banks.lock();
        let bank = banks.entry(unit).or_default();
        for (i, word) in words.iter().enumerate() {
            bank.insert(start + i as u16, *word);
        }
    }

    /// Store an f32 most significant register first.
    pub fn set_f32(&self, unit: u8, address: u16, value: f32) {
        let bits = value.to_bits();
        self.set_registers(unit, address, &[(bits >> 16) as u16, bits as u16]);
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Accept requests but never answer them.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Answer with one register fewer than requested.
    pub fn set_short_responses(&self, short: bool) {
        self.state.short.store(short, Ordering::SeqCst);
    }

    /// Answer requests for `unit` with an "illegal data address" exception.
    pub fn fail_unit(&self, unit: u8) {
        self.state.exception_units.lock().insert(unit);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Most requests answered concurrently, across all connections.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<SimState>) {
    loop {
        // MBAP header: transaction id, protocol id, length, unit id
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit = header[6];

        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        state.requests.fetch_add(1, Ordering::SeqCst);

        if state.stalled.load(Ordering::SeqCst) {
            continue;
        }

        let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = respond(&state, unit, &pdu);
        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut frame = Vec::with_capacity(7 + response.len());
        frame.extend_from_slice(&header[0..4]);
        frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(&response);

        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn respond(state: &SimState, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let function = pdu.first().copied().unwrap_or(0);
    if function != READ_INPUT_REGISTERS || pdu.len() < 5 {
        return vec![function | 0x80, 0x01];
    }
    if state.exception_units.lock().contains(&unit) {
        return vec![function | 0x80, ILLEGAL_DATA_ADDRESS];
    }

    let address = u16::from_be_bytes([pdu[1], pdu[2]]);
    let mut count = u16::from_be_bytes([pdu[3], pdu[4]]);
    if state.short.load(Ordering::SeqCst) {
        count = count.saturating_sub(1);
    }

    let banks = state.banks.lock();
    let bank = banks.get(&unit);
    let mut response = vec![function, (count * 2) as u8];
    for offset in 0..count {
        let word = bank
            .and_then(|b| b.get(&(address + offset)))
            .copied()
            .unwrap_or(0);
        response.extend_from_slice(&word.to_be_bytes());
    }
    response
}

/// Sink that keeps every written sample.
#[derive(Clone, Default)]
pub struct CaptureSink {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl CaptureSink {
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }
}

impl PointSink for CaptureSink {
    async fn write(&self, samples: &[Sample]) -> Result<(), SinkError> {
        self.samples.lock().extend_from_slice(samples);
        Ok(())
    }
}

/// Minimal bridge configuration pointing at `port` on localhost.
pub fn config_json5(port: u16, scan_interval_ms: u64, devices: &str) -> String {
    format!(
        r#"{{
            modbus: {{ host: "127.0.0.1", port: {port}, timeout_ms: 300 }},
            influxdb: {{
                url: "http://127.0.0.1:9",
                api: {{ version: "v2", org: "grid", bucket: "gis", token: "t" }},
            }},
            templates: {{
                gdt20: {{
                    scan_interval_ms: {scan_interval_ms},
                    tags: {{ sensor: "WIKA GDT20" }},
                    fields: [
                        {{ address: 0, name: "pressure", type: "f32", tags: {{ unit: "bar" }} }},
                        {{ address: 12, name: "temperature", type: "f32", tags: {{ unit: "°C" }} }},
                        {{ address: 20, name: "gas_density", type: "f32", tags: {{ unit: "kg/m³" }} }},
                    ],
                }},
            }},
            devices: {devices},
        }}"#
    )
}

/// The three-phase gas compartment used across the scenarios.
pub const GDT20_DEVICES: &str = r#"[
    { id: 1, template: "gdt20", tags: { gas_compartment: "CB", phase: "L1" } },
    { id: 2, template: "gdt20", tags: { gas_compartment: "CB", phase: "L2" } },
    { id: 3, template: "gdt20", tags: { gas_compartment: "CB", phase: "L3" } },
]"#;
