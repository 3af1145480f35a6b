/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The bundled UDP session backend.
//!
//! RTP is received and sent on the configured port, RTCP on the next port
//! up. A dedicated receive thread parses incoming RTP and RTCP, keeps
//! per-source reception state (pending packets, interarrival jitter, CNAME,
//! sender report timing) and periodically announces the outgoing stream with
//! an RTCP sender report plus SDES CNAME. [`RtpSession::poll`] drains that
//! state into [`SourceReport`]s on the caller's thread.

use crate::{
    config::UdpSessionConfig,
    error::{SessionError, SessionResult, WrappedRtpPacketBuildError},
    message::SrTiming,
    session::{RtpPacket, RtpSession, SourceReport},
    socket::create_rtp_socket_pair,
    time::{ntp_from_system_time, system_time_from_ntp, unix_seconds},
};
use bytes::Bytes;
use dashmap::DashMap;
use rtcp::{
    packet::Packet,
    sender_report::SenderReport,
    source_description::{SdesType, SourceDescription, SourceDescriptionChunk,
                         SourceDescriptionItem},
};
use rtp_rs::{RtpPacketBuilder, RtpReader, Seq};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime},
};
use tokio::{
    net::UdpSocket,
    runtime, select,
    sync::{mpsc, watch},
};
use tracing::{debug, info, instrument, warn};

const RECEIVE_BUFFER_SIZE: usize = 65_535;
const SEND_QUEUE_DEPTH: usize = 1024;
const MAX_RTP_PACKET_SIZE: usize = 1500;

#[derive(Default)]
struct SourceState {
    cname: Bytes,
    pending: Vec<RtpPacket>,
    jitter_units: f64,
    last_transit: Option<f64>,
    estimated_unit: Option<f64>,
    last_sr: Option<SrTiming>,
    prev_sr: Option<(f64, u32)>,
}

/// Outgoing stream counters shared between `send` and the report timer. The
/// basis pair maps the most recent packet's RTP timestamp to the wallclock
/// instant its first sample was produced.
#[derive(Default)]
struct TxState {
    packet_count: u32,
    octet_count: u32,
    basis: Option<(SystemTime, u32)>,
}

pub struct UdpRtpSession {
    out_tx: mpsc::Sender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    sources: Arc<DashMap<u32, SourceState>>,
    active: Arc<AtomicBool>,
    tx_state: Arc<Mutex<TxState>>,
    payload_clock_rates: HashMap<u8, u32>,
    ssrc: u32,
    sequence: Seq,
    timestamp: u32,
    pre_transmission_delay: Duration,
    local_rtp_port: u16,
}

impl UdpRtpSession {
    #[instrument(skip(config), fields(port = config.rtp_port))]
    pub fn new(config: UdpSessionConfig) -> SessionResult<Self> {
        let (rtp_std, rtcp_std) = create_rtp_socket_pair(&config)?;
        let local_rtp_port = rtp_std.local_addr()?.port();

        let sources = Arc::new(DashMap::new());
        let active = Arc::new(AtomicBool::new(true));
        let tx_state = Arc::new(Mutex::new(TxState::default()));
        let ssrc = rand::random();

        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (result_tx, result_rx) = crossbeam::channel::bounded(1);

        let rtcp_destinations = config
            .destinations
            .iter()
            .map(|addr| SocketAddr::new(addr.ip(), addr.port() + 1))
            .collect();
        let receive_loop_template = ReceiveLoopConfig {
            destinations: config.destinations.clone(),
            rtcp_destinations,
            ssrc,
            cname: config.cname.clone(),
            clock_rate: config.clock_rate,
            payload_clock_rates: config.payload_clock_rates.clone(),
            report_interval: config.report_interval,
        };

        {
            let sources = Arc::clone(&sources);
            let active = Arc::clone(&active);
            let tx_state = Arc::clone(&tx_state);
            thread::Builder::new()
                .name(format!("rtp-session-{local_rtp_port}"))
                .spawn(move || {
                    let runtime = match runtime::Builder::new_current_thread().enable_all().build()
                    {
                        Ok(it) => it,
                        Err(e) => {
                            active.store(false, Ordering::SeqCst);
                            result_tx.send(Err(SessionError::from(e))).ok();
                            return;
                        }
                    };
                    runtime.block_on(async move {
                        let rtp_socket = match UdpSocket::from_std(rtp_std) {
                            Ok(it) => it,
                            Err(e) => {
                                active.store(false, Ordering::SeqCst);
                                result_tx.send(Err(SessionError::from(e))).ok();
                                return;
                            }
                        };
                        let rtcp_socket = match UdpSocket::from_std(rtcp_std) {
                            Ok(it) => it,
                            Err(e) => {
                                active.store(false, Ordering::SeqCst);
                                result_tx.send(Err(SessionError::from(e))).ok();
                                return;
                            }
                        };
                        result_tx.send(Ok(())).ok();
                        ReceiveLoop {
                            rtp_socket,
                            rtcp_socket,
                            out_rx,
                            shutdown: shutdown_rx,
                            sources,
                            active,
                            tx_state,
                            epoch: Instant::now(),
                            config: receive_loop_template,
                        }
                        .run()
                        .await;
                    });
                })?;
        }

        result_rx
            .recv()
            .map_err(|_| SessionError::ChannelClosed)??;

        info!("RTP session listening on port {local_rtp_port}.");

        Ok(UdpRtpSession {
            out_tx,
            shutdown_tx,
            sources,
            active,
            tx_state,
            payload_clock_rates: config.payload_clock_rates,
            ssrc,
            sequence: Seq::from(rand::random::<u16>()),
            timestamp: rand::random(),
            pre_transmission_delay: Duration::ZERO,
            local_rtp_port,
        })
    }

    pub fn local_rtp_port(&self) -> u16 {
        self.local_rtp_port
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn close(&self) {
        self.shutdown_tx.send(true).ok();
    }
}

impl Drop for UdpRtpSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl RtpSession for UdpRtpSession {
    fn poll(&mut self) -> SessionResult<Vec<SourceReport>> {
        if !self.is_active() {
            return Err(SessionError::Inactive);
        }

        let mut reports = Vec::new();
        for mut entry in self.sources.iter_mut() {
            if entry.pending.is_empty() {
                continue;
            }
            let packets = std::mem::take(&mut entry.pending);
            let timestamp_unit = self
                .payload_clock_rates
                .get(&packets[0].payload_type)
                .map(|rate| 1.0 / f64::from(*rate));
            reports.push(SourceReport {
                ssrc: *entry.key(),
                cname: entry.cname.clone(),
                jitter_units: entry.jitter_units,
                timestamp_unit,
                estimated_timestamp_unit: entry.estimated_unit,
                sender_report: entry.last_sr.clone(),
                packets,
            });
        }
        Ok(reports)
    }

    fn send(
        &mut self,
        payload: &[u8],
        payload_type: u8,
        marker: bool,
        timestamp_increment: u32,
    ) -> SessionResult<()> {
        if !self.is_active() {
            return Err(SessionError::Inactive);
        }

        let sequence = self.sequence;
        self.sequence = sequence.next();
        let timestamp = self.timestamp;
        self.timestamp = timestamp.wrapping_add(timestamp_increment);

        let packet = RtpPacketBuilder::new()
            .payload_type(payload_type)
            .marked(marker)
            .sequence(sequence)
            .timestamp(timestamp)
            .ssrc(self.ssrc)
            .payload(payload)
            .build()
            .map_err(WrappedRtpPacketBuildError)?;

        if packet.len() > MAX_RTP_PACKET_SIZE {
            warn!(
                "Outgoing RTP packet of {} bytes exceeds the usual MTU.",
                packet.len()
            );
        }

        {
            let mut tx = self
                .tx_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tx.packet_count = tx.packet_count.wrapping_add(1);
            tx.octet_count = tx.octet_count.wrapping_add(payload.len() as u32);
            tx.basis = Some((SystemTime::now() - self.pre_transmission_delay, timestamp));
        }

        self.out_tx
            .blocking_send(packet)
            .map_err(|_| SessionError::ChannelClosed)
    }

    fn set_pre_transmission_delay(&mut self, delay: Duration) -> SessionResult<()> {
        self.pre_transmission_delay = delay;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct ReceiveLoopConfig {
    destinations: Vec<SocketAddr>,
    rtcp_destinations: Vec<SocketAddr>,
    ssrc: u32,
    cname: String,
    clock_rate: u32,
    payload_clock_rates: HashMap<u8, u32>,
    report_interval: Duration,
}

struct ReceiveLoop {
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    out_rx: mpsc::Receiver<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
    sources: Arc<DashMap<u32, SourceState>>,
    active: Arc<AtomicBool>,
    tx_state: Arc<Mutex<TxState>>,
    epoch: Instant,
    config: ReceiveLoopConfig,
}

impl ReceiveLoop {
    async fn run(mut self) {
        let mut rtp_buffer = [0u8; RECEIVE_BUFFER_SIZE];
        let mut rtcp_buffer = [0u8; RECEIVE_BUFFER_SIZE];
        let mut report_timer = tokio::time::interval(self.config.report_interval);
        report_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                Ok((len, _)) = self.rtp_socket.recv_from(&mut rtp_buffer) => {
                    self.rtp_received(&rtp_buffer[..len]);
                },
                Ok((len, _)) = self.rtcp_socket.recv_from(&mut rtcp_buffer) => {
                    self.rtcp_received(&rtcp_buffer[..len]);
                },
                out = self.out_rx.recv() => match out {
                    Some(datagram) => self.transmit(&datagram).await,
                    None => break,
                },
                _ = report_timer.tick() => self.send_report().await,
                _ = self.shutdown.changed() => break,
                else => break,
            }
        }

        self.active.store(false, Ordering::SeqCst);
        info!("RTP session receive loop stopped.");
    }

    fn rtp_received(&mut self, data: &[u8]) {
        let rtp = match RtpReader::new(data) {
            Ok(it) => it,
            Err(e) => {
                debug!("Discarding malformed RTP packet: {e:?}");
                return;
            }
        };
        let ssrc = rtp.ssrc();
        if ssrc == self.config.ssrc {
            return;
        }

        let mut entry = self.sources.entry(ssrc).or_default();

        // RFC 3550 interarrival jitter, in timestamp units. Without a known
        // or estimated clock rate the arrival time cannot be expressed in
        // units, so the estimate stays at zero until one is available.
        let unit = self
            .config
            .payload_clock_rates
            .get(&rtp.payload_type())
            .map(|rate| 1.0 / f64::from(*rate))
            .or(entry.estimated_unit);
        if let Some(unit) = unit {
            let arrival_units = self.epoch.elapsed().as_secs_f64() / unit;
            let transit = arrival_units - f64::from(rtp.timestamp());
            if let Some(last_transit) = entry.last_transit {
                let d = (transit - last_transit).abs();
                entry.jitter_units += (d - entry.jitter_units) / 16.0;
            }
            entry.last_transit = Some(transit);
        }

        entry.pending.push(RtpPacket {
            ssrc,
            payload_type: rtp.payload_type(),
            sequence: rtp.sequence_number().into(),
            timestamp: rtp.timestamp(),
            marker: rtp.mark(),
            payload: Bytes::copy_from_slice(rtp.payload()),
        });
    }

    fn rtcp_received(&mut self, data: &[u8]) {
        let mut buf = data;
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(it) => it,
            Err(e) => {
                debug!("Discarding malformed RTCP compound: {e}");
                return;
            }
        };

        for packet in packets {
            let any = packet.as_any();
            if let Some(sr) = any.downcast_ref::<SenderReport>() {
                if sr.ssrc == self.config.ssrc || sr.ntp_time == 0 {
                    continue;
                }
                let wallclock = system_time_from_ntp(sr.ntp_time);
                let wall_seconds = unix_seconds(wallclock);
                let mut entry = self.sources.entry(sr.ssrc).or_default();
                if let Some((prev_seconds, prev_ts)) = entry.prev_sr {
                    let elapsed = wall_seconds - prev_seconds;
                    let ticks = sr.rtp_time.wrapping_sub(prev_ts) as i32;
                    if elapsed > 0.0 && ticks > 0 {
                        entry.estimated_unit = Some(elapsed / f64::from(ticks));
                    }
                }
                entry.prev_sr = Some((wall_seconds, sr.rtp_time));
                entry.last_sr = Some(SrTiming {
                    wallclock,
                    rtp_timestamp: sr.rtp_time,
                });
            } else if let Some(sdes) = any.downcast_ref::<SourceDescription>() {
                for chunk in &sdes.chunks {
                    if chunk.source == self.config.ssrc {
                        continue;
                    }
                    for item in &chunk.items {
                        if item.sdes_type == SdesType::SdesCname {
                            self.sources.entry(chunk.source).or_default().cname =
                                item.text.clone();
                        }
                    }
                }
            }
        }
    }

    async fn transmit(&self, datagram: &[u8]) {
        for destination in &self.config.destinations {
            if let Err(e) = self.rtp_socket.send_to(datagram, *destination).await {
                warn!("Could not send RTP packet to {destination}: {e}");
            }
        }
    }

    async fn send_report(&self) {
        let (packet_count, octet_count, basis) = {
            let tx = self.tx_state.lock().unwrap_or_else(PoisonError::into_inner);
            (tx.packet_count, tx.octet_count, tx.basis)
        };
        // Nothing sent yet, so there is no RTP clock to report.
        let Some((sampling_wallclock, rtp_timestamp)) = basis else {
            return;
        };

        let now = SystemTime::now();
        let elapsed = now.duration_since(sampling_wallclock).unwrap_or_default();
        let rtp_time = rtp_timestamp
            .wrapping_add((elapsed.as_secs_f64() * f64::from(self.config.clock_rate)) as u32);

        let sender_report = SenderReport {
            ssrc: self.config.ssrc,
            ntp_time: ntp_from_system_time(now),
            rtp_time,
            packet_count,
            octet_count,
            reports: Vec::new(),
            profile_extensions: Bytes::new(),
        };
        let source_description = SourceDescription {
            chunks: vec![SourceDescriptionChunk {
                source: self.config.ssrc,
                items: vec![SourceDescriptionItem {
                    sdes_type: SdesType::SdesCname,
                    text: Bytes::from(self.config.cname.clone()),
                }],
            }],
        };
        let packets: Vec<Box<dyn Packet + Send + Sync>> =
            vec![Box::new(sender_report), Box::new(source_description)];

        let compound = match rtcp::packet::marshal(&packets) {
            Ok(it) => it,
            Err(e) => {
                warn!("Could not marshal RTCP report: {e}");
                return;
            }
        };
        for destination in &self.config.rtcp_destinations {
            if let Err(e) = self.rtcp_socket.send_to(&compound, *destination).await {
                warn!("Could not send RTCP report to {destination}: {e}");
            }
        }
    }
}
