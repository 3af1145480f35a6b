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

//! Localhost loopback: a test tone is packetized as L16, sent over RTP to a
//! second session in the same process, received again, depacketized and
//! counted. Demonstrates chain wiring, the RTP stage pair and synchronizer
//! feeding from received sender report timing.

use bytes::Bytes;
use clap::Parser;
use moip_rs::{
    chain::{Chain, Connection},
    config::UdpSessionConfig,
    error::{StageError, StageResult},
    message::{Message, MessageBody, RawAudioFrame, RtpSendPacket, SampleEncoding},
    queue::{MessageTransform, TransformStage},
    rtp::{FixedRateDecoder, RtpStage},
    session::UdpRtpSession,
    stage::{StageCtx, shared},
    stages::{FrequencyGenerator, IntervalTimer, MessageDump, SampleConverter},
    sync::RtpSynchronizer,
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    thread,
    time::{Duration, SystemTime},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PAYLOAD_TYPE: u8 = 96;
const SAMPLE_RATE: u32 = 48_000;

#[derive(Parser, Debug)]
#[command(about = "RTP loopback demo chain")]
struct Args {
    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    frequency: f64,
    /// Chain period in milliseconds
    #[arg(long, default_value_t = 20)]
    period_ms: u64,
    /// How long to run, in seconds
    #[arg(long, default_value_t = 3)]
    seconds: u64,
}

/// Turns raw S16BE audio into RTP send messages, one packet per block.
struct L16Packetizer;

impl MessageTransform for L16Packetizer {
    fn name(&self) -> &str {
        "L16Packetizer"
    }

    fn transform(&mut self, _ctx: &StageCtx<'_>, msg: &Message) -> StageResult<Option<Message>> {
        let MessageBody::RawAudio(frame) = msg.body() else {
            return Err(StageError::BadMessage {
                msg_type: msg.message_type(),
                subtype: msg.subtype(),
            });
        };
        let mut out = Message::rtp_send(RtpSendPacket {
            payload: frame.payload.clone(),
            payload_type: PAYLOAD_TYPE,
            marker: false,
            timestamp_increment: frame.frames,
        });
        out.copy_media_info_from(msg);
        if out.sampling_instant().is_none() {
            out.set_sampling_instant(SystemTime::now());
        }
        Ok(Some(out))
    }
}

/// Turns received RTP packets back into raw S16BE audio and feeds the
/// synchronizer with the stream's sender report timing.
struct L16Depacketizer {
    channels: u16,
    synchronizer: Arc<RtpSynchronizer>,
    stream: Option<moip_rs::sync::StreamId>,
}

impl MessageTransform for L16Depacketizer {
    fn name(&self) -> &str {
        "L16Depacketizer"
    }

    fn transform(&mut self, _ctx: &StageCtx<'_>, msg: &Message) -> StageResult<Option<Message>> {
        let MessageBody::RtpReceive(packet) = msg.body() else {
            return Err(StageError::BadMessage {
                msg_type: msg.message_type(),
                subtype: msg.subtype(),
            });
        };

        if self.stream.is_none() && !packet.cname.is_empty() {
            let unit = packet.timestamp_unit.unwrap_or(1.0 / f64::from(SAMPLE_RATE));
            if let Ok(id) = self.synchronizer.register(&packet.cname, unit) {
                info!("Registered stream {id} for synchronization.");
                self.stream = Some(id);
            }
        }
        if let (Some(id), Some(sr)) = (self.stream, &packet.sr_timing) {
            self.synchronizer
                .set_stream_info(
                    id,
                    sr.wallclock,
                    sr.rtp_timestamp,
                    packet.timestamp,
                    Duration::ZERO,
                    packet.jitter,
                )
                .ok();
            let offset = self.synchronizer.synchronization_offset(id);
            info!("Stream {id} synchronization offset: {offset:?}");
        }

        let bytes_per_frame = usize::from(self.channels) * 2;
        let frames = (packet.payload.len() / bytes_per_frame) as u32;
        let frame = RawAudioFrame::new(
            SampleEncoding::S16Be,
            SAMPLE_RATE,
            self.channels,
            frames,
            Bytes::copy_from_slice(&packet.payload),
        )?;
        let mut out = Message::raw_audio(frame);
        out.copy_media_info_from(msg);
        Ok(Some(out))
    }
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let period = Duration::from_millis(args.period_ms);

    let rx_config = UdpSessionConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        cname: "loopback-rx@localhost".to_owned(),
        payload_clock_rates: HashMap::from([(PAYLOAD_TYPE, SAMPLE_RATE)]),
        report_interval: Duration::from_millis(500),
        ..UdpSessionConfig::default()
    };
    let rx_session = UdpRtpSession::new(rx_config).map_err(|e| miette::miette!("{e}"))?;

    let tx_config = UdpSessionConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        destinations: vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            rx_session.local_rtp_port(),
        )],
        cname: "loopback-tx@localhost".to_owned(),
        clock_rate: SAMPLE_RATE,
        report_interval: Duration::from_millis(500),
        ..UdpSessionConfig::default()
    };
    let tx_session = UdpRtpSession::new(tx_config).map_err(|e| miette::miette!("{e}"))?;

    let synchronizer = Arc::new(RtpSynchronizer::new());

    let timer = shared(IntervalTimer::new(period));
    let generator = shared(FrequencyGenerator::new(
        args.frequency,
        args.frequency * 1.5,
        0.8,
        0.8,
        SAMPLE_RATE,
        period,
    ));
    let converter = shared(TransformStage::new(SampleConverter::new(
        SampleEncoding::S16Be,
    )));
    let packetizer = shared(TransformStage::new(L16Packetizer));
    let mut tx_stage = RtpStage::new(Box::new(tx_session));
    tx_stage.set_silent_timestamp_increment(SAMPLE_RATE / 50);
    let rtp_tx = shared(tx_stage);
    let mut rx_stage = RtpStage::new(Box::new(rx_session));
    rx_stage.register_decoder(PAYLOAD_TYPE, Box::new(FixedRateDecoder::new(SAMPLE_RATE)));
    let rtp_rx = shared(rx_stage);
    let depacketizer = shared(TransformStage::new(L16Depacketizer {
        channels: 2,
        synchronizer: Arc::clone(&synchronizer),
        stream: None,
    }));
    let dump_stage = Arc::new(std::sync::Mutex::new(MessageDump::new()));
    let dump: moip_rs::stage::SharedStage = dump_stage.clone();

    let mut chain = Chain::new("loopback");
    chain.set_exit_handler(|exit| match exit.failure {
        Some(failure) => eprintln!(
            "chain '{}' failed in stage '{}': {}",
            exit.chain, failure.stage, failure.message
        ),
        None => info!("chain '{}' finished", exit.chain),
    });
    chain.set_start(timer.clone());

    let wire = |chain: &mut Chain, from: &moip_rs::stage::SharedStage, to: &moip_rs::stage::SharedStage| {
        chain
            .add_connection(Connection::new(from.clone(), to.clone()))
            .map_err(|e| miette::miette!("{e}"))
    };
    wire(&mut chain, &timer, &generator)?;
    wire(&mut chain, &generator, &converter)?;
    wire(&mut chain, &converter, &packetizer)?;
    wire(&mut chain, &packetizer, &rtp_tx)?;
    wire(&mut chain, &timer, &rtp_rx)?;
    wire(&mut chain, &rtp_rx, &depacketizer)?;
    wire(&mut chain, &depacketizer, &dump)?;

    chain.start().map_err(|e| miette::miette!("{e}"))?;
    info!(
        "Loopback chain running at {:?} period for {} s.",
        period, args.seconds
    );
    thread::sleep(Duration::from_secs(args.seconds));
    chain.stop().map_err(|e| miette::miette!("{e}"))?;

    let received = dump_stage
        .lock()
        .map_err(|_| miette::miette!("dump stage poisoned"))?
        .count();
    println!("received {received} audio blocks over the loopback");
    Ok(())
}
