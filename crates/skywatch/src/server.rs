//! The arbiter's I/O shell.
//!
//! One select loop owns the Block and the Arbiter: it accepts sockets,
//! funnels every reader task's bytes through a single event channel, runs a
//! periodic idle tick, and after each pass drains every connection's staged
//! outbox to its socket writer. All protocol decisions happen inside
//! [`Arbiter`] on this one task; the socket tasks never touch shared state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use skyconf::SkyConfig;
use skycore::{flush_outbox, spawn_reader, spawn_writer, Block, ConnId, NetEvent, Outbound};

use crate::arbiter::Arbiter;

/// Granularity of the idle sweep (keepalive, timers, gated-command checks).
const IDLE_TICK: Duration = Duration::from_secs(1);

pub struct Server {
    arbiter: Arbiter,
    block: Block,
    outbounds: HashMap<ConnId, Outbound>,
}

impl Server {
    pub fn new(config: SkyConfig) -> Self {
        let mut arbiter = Arbiter::new(config);
        arbiter.init(Utc::now());
        Self { arbiter, block: Block::new(), outbounds: HashMap::new() }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self, port: u16, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;
        info!(port, "skywatch arbiter listening");

        let (events_tx, mut events_rx) = mpsc::channel::<NetEvent>(256);
        let mut tick = tokio::time::interval(IDLE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let now = Instant::now();
                            let _ = socket.set_nodelay(true);
                            let id = self.block.add_accepted(now);
                            debug!(conn = id.0, %addr, "accepted connection");
                            let (read_half, write_half) = socket.into_split();
                            spawn_reader(id, read_half, events_tx.clone());
                            let (outbound, _) = spawn_writer(id, write_half);
                            self.outbounds.insert(id, outbound);
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }

                Some(event) = events_rx.recv() => {
                    let now = Instant::now();
                    match event {
                        NetEvent::Bytes { id, data } => self.bytes_received(id, &data, now),
                        NetEvent::Closed { id, reason } => {
                            debug!(conn = id.0, ?reason, "socket closed");
                            self.arbiter.remove_connection(&mut self.block, id, now);
                            self.outbounds.remove(&id);
                        }
                    }
                }

                _ = tick.tick() => {
                    self.arbiter.idle(&mut self.block, Instant::now(), Utc::now());
                }

                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }

            self.flush_all(Instant::now());
        }

        Ok(())
    }

    /// Feed raw bytes into a connection and dispatch every decoded event.
    fn bytes_received(&mut self, id: ConnId, data: &[u8], now: Instant) {
        if let Some(conn) = self.block.get_mut(id) {
            conn.feed(data, now);
        } else {
            return;
        }
        loop {
            let event = match self.block.get_mut(id) {
                Some(conn) => conn.next_event(),
                None => return,
            };
            match event {
                Ok(Some(event)) => self.arbiter.handle_event(&mut self.block, id, event, now),
                Ok(None) => break,
                Err(e) => {
                    // Unparsable framing means the byte stream is lost;
                    // tear the connection down rather than guess.
                    warn!(conn = id.0, error = %e, "protocol corruption, closing");
                    self.arbiter.remove_connection(&mut self.block, id, now);
                    self.outbounds.remove(&id);
                    return;
                }
            }
        }
    }

    /// Drain staged outbound frames; a broken writer tears its peer down.
    fn flush_all(&mut self, now: Instant) {
        let mut broken = Vec::new();
        for id in self.block.ids() {
            let Some(conn) = self.block.get_mut(id) else { continue };
            match self.outbounds.get(&id) {
                Some(outbound) => {
                    if !flush_outbox(conn, outbound) {
                        broken.push(id);
                    }
                }
                None => {
                    // Writer never attached (connection raced teardown).
                    conn.take_outbox();
                }
            }
        }
        for id in broken {
            warn!(conn = id.0, "writer gone, closing connection");
            self.arbiter.remove_connection(&mut self.block, id, now);
            self.outbounds.remove(&id);
        }
    }
}
