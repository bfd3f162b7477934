//! Telnet session transport
//!
//! Each TCP connection is put into character-at-a-time mode, asked for its
//! window size (NAWS) and then registered with the aquarium. Telnet commands
//! are stripped from the inbound stream before it reaches the input decoder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::aquarium::manager::{AquariumManager, SessionProfile};
use crate::aquarium::state::GridSize;
use crate::net::input::InputDecoder;
use crate::net::sink::{SessionSink, SinkError};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_NAWS: u8 = 31;

/// Sent on connect: we echo, no go-ahead both ways, please report your size
const NEGOTIATION: &[u8] = &[
    IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA, IAC, DO, OPT_SGA, IAC, DO, OPT_NAWS,
];

/// How long to wait for a NAWS report before registering with the default grid
const NAWS_GRACE: Duration = Duration::from_millis(500);

const READ_BUFFER: usize = 1024;
const MAX_SUBNEGOTIATION: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Data,
    Iac,
    Option,
    Sub,
    SubIac,
}

/// Separates telnet commands from terminal data
#[derive(Debug)]
pub struct TelnetFilter {
    state: FilterState,
    sub: Vec<u8>,
}

impl Default for TelnetFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self {
            state: FilterState::Data,
            sub: Vec::with_capacity(MAX_SUBNEGOTIATION),
        }
    }

    /// Strip commands from `input`, returning the terminal data and the last
    /// window size reported in it. Commands may span calls.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Option<GridSize>) {
        let mut data = Vec::with_capacity(input.len());
        let mut grid = None;

        for &byte in input {
            self.state = match (self.state, byte) {
                (FilterState::Data, IAC) => FilterState::Iac,
                (FilterState::Data, _) => {
                    data.push(byte);
                    FilterState::Data
                }
                (FilterState::Iac, IAC) => {
                    data.push(IAC);
                    FilterState::Data
                }
                (FilterState::Iac, WILL | WONT | DO | DONT) => FilterState::Option,
                (FilterState::Iac, SB) => {
                    self.sub.clear();
                    FilterState::Sub
                }
                (FilterState::Iac, _) => FilterState::Data,
                (FilterState::Option, _) => FilterState::Data,
                (FilterState::Sub, IAC) => FilterState::SubIac,
                (FilterState::Sub, _) => {
                    if self.sub.len() < MAX_SUBNEGOTIATION {
                        self.sub.push(byte);
                    }
                    FilterState::Sub
                }
                (FilterState::SubIac, SE) => {
                    if let Some(size) = parse_naws(&self.sub) {
                        grid = Some(size);
                    }
                    FilterState::Data
                }
                (FilterState::SubIac, IAC) => {
                    if self.sub.len() < MAX_SUBNEGOTIATION {
                        self.sub.push(IAC);
                    }
                    FilterState::Sub
                }
                (FilterState::SubIac, _) => FilterState::Sub,
            };
        }

        (data, grid)
    }
}

fn parse_naws(sub: &[u8]) -> Option<GridSize> {
    match sub {
        [OPT_NAWS, w_hi, w_lo, h_hi, h_lo] => {
            let grid = GridSize::new(
                u16::from_be_bytes([*w_hi, *w_lo]) as u32,
                u16::from_be_bytes([*h_hi, *h_lo]) as u32,
            );
            grid.is_known().then_some(grid)
        }
        _ => None,
    }
}

/// Write half of a telnet connection
struct TcpSink {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

#[async_trait]
impl SessionSink for TcpSink {
    async fn write(&self, data: Bytes) -> Result<(), SinkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SinkError::Closed)?;
        writer.write_all(&data).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Telnet front end for the aquarium
pub struct TelnetServer {
    addr: SocketAddr,
    manager: AquariumManager,
}

impl TelnetServer {
    pub fn new(addr: SocketAddr, manager: AquariumManager) -> Self {
        Self { addr, manager }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Aquarium listening on telnet://{}", listener.local_addr()?);
        serve(listener, self.manager).await
    }
}

/// Accept connections on an already bound listener
pub async fn serve(listener: TcpListener, manager: AquariumManager) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let manager = manager.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, peer, manager).await {
                warn!("Connection {} error: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, manager: AquariumManager) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();
    writer.write_all(NEGOTIATION).await?;

    let mut filter = TelnetFilter::new();
    let mut buffer = [0u8; READ_BUFFER];
    let mut early = Vec::new();
    let mut grid = None;

    let deadline = tokio::time::Instant::now() + NAWS_GRACE;
    while grid.is_none() {
        match tokio::time::timeout_at(deadline, reader.read(&mut buffer)).await {
            Ok(Ok(0)) => {
                debug!("{} closed before registering", peer);
                return Ok(());
            }
            Ok(Ok(n)) => {
                let (data, size) = filter.feed(&buffer[..n]);
                early.extend_from_slice(&data);
                grid = size;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    let grid = grid.unwrap_or_else(|| {
        debug!("{} sent no window size, assuming {}x{}", peer, GridSize::DEFAULT.columns, GridSize::DEFAULT.rows);
        GridSize::DEFAULT
    });

    let sink = Arc::new(TcpSink {
        writer: tokio::sync::Mutex::new(Some(writer)),
    });
    let id = manager.register(
        sink,
        SessionProfile {
            display_name: peer.ip().to_string(),
            grid,
        },
    );

    let mut decoder = InputDecoder::new();
    if manager.route_input(id, &mut decoder, &early) {
        loop {
            let n = match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read failed: {}", id, e);
                    break;
                }
            };
            let (data, resized) = filter.feed(&buffer[..n]);
            if let Some(size) = resized {
                debug!("{} resized to {}x{}", id, size.columns, size.rows);
            }
            if !manager.route_input(id, &mut decoder, &data) {
                break;
            }
        }
    }

    manager.unregister(id);
    Ok(())
}
