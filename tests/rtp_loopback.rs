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

//! Two UDP sessions talking over localhost: payload delivery, RTCP CNAME and
//! sender report propagation, and the RTP stage on top.

use moip_rs::{
    config::UdpSessionConfig,
    message::MessageBody,
    rtp::{FixedRateDecoder, RtpStage},
    session::{RtpSession, UdpRtpSession},
    stage::{Stage, StageCtx},
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, SystemTime},
};

fn receiver_config() -> UdpSessionConfig {
    UdpSessionConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        cname: "receiver@test".to_owned(),
        payload_clock_rates: HashMap::from([(96, 8000)]),
        report_interval: Duration::from_millis(200),
        ..UdpSessionConfig::default()
    }
}

fn sender_config(receiver_port: u16) -> UdpSessionConfig {
    UdpSessionConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        destinations: vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            receiver_port,
        )],
        cname: "sender@test".to_owned(),
        clock_rate: 8000,
        report_interval: Duration::from_millis(200),
        ..UdpSessionConfig::default()
    }
}

#[test]
fn sessions_exchange_rtp_and_rtcp_over_localhost() {
    let mut receiver = UdpRtpSession::new(receiver_config()).expect("receiver session");
    let mut sender =
        UdpRtpSession::new(sender_config(receiver.local_rtp_port())).expect("sender session");

    for payload in [b"one".as_slice(), b"two", b"three"] {
        sender.send(payload, 96, false, 160).expect("send");
        thread::sleep(Duration::from_millis(5));
    }

    thread::sleep(Duration::from_millis(200));
    let reports = receiver.poll().expect("poll");
    assert_eq!(reports.len(), 1, "one source expected");
    let report = &reports[0];
    assert_eq!(report.ssrc, sender.ssrc());
    assert_eq!(report.timestamp_unit, Some(1.0 / 8000.0));
    assert_eq!(report.packets.len(), 3);

    let payloads: Vec<&[u8]> = report.packets.iter().map(|p| p.payload.as_ref()).collect();
    assert_eq!(payloads, vec![b"one".as_slice(), b"two", b"three"]);
    for packet in &report.packets {
        assert_eq!(packet.payload_type, 96);
    }
    // the timestamp clock advances by the increment per packet
    assert_eq!(
        report.packets[1]
            .timestamp
            .wrapping_sub(report.packets[0].timestamp),
        160
    );
    assert_eq!(
        report.packets[1].sequence.wrapping_sub(report.packets[0].sequence),
        1
    );

    // a drained source is not reported again until new data arrives
    assert!(receiver.poll().expect("second poll").is_empty());

    // wait for RTCP: CNAME via SDES and timing via the sender report
    thread::sleep(Duration::from_millis(500));
    sender.send(b"four", 96, false, 160).expect("send");
    thread::sleep(Duration::from_millis(200));

    let reports = receiver.poll().expect("rtcp poll");
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.cname.as_ref(), b"sender@test");
    let sr = report.sender_report.as_ref().expect("sender report timing");
    let age = SystemTime::now()
        .duration_since(sr.wallclock)
        .expect("sr wallclock in the past");
    assert!(age < Duration::from_secs(5), "implausible SR age {age:?}");

    receiver.close();
    sender.close();
    thread::sleep(Duration::from_millis(50));
    assert!(!receiver.is_active());
}

#[test]
fn rtp_stage_emits_received_packets_as_messages() {
    let receiver = UdpRtpSession::new(receiver_config()).expect("receiver session");
    let mut sender =
        UdpRtpSession::new(sender_config(receiver.local_rtp_port())).expect("sender session");
    let sender_ssrc = sender.ssrc();

    let mut stage = RtpStage::new(Box::new(receiver));
    stage.register_decoder(96, Box::new(FixedRateDecoder::new(8000)));

    sender.send(b"payload-a", 96, true, 160).expect("send");
    sender.send(b"payload-b", 96, false, 160).expect("send");
    thread::sleep(Duration::from_millis(200));

    let ctx = StageCtx {
        chain_id: 1,
        chain_name: "loopback",
        iteration: 1,
    };
    let first = stage.pull(&ctx).expect("pull").expect("first message");
    assert_eq!(first.source_id(), u64::from(sender_ssrc));
    assert_eq!(first.timestamp_unit(), Some(1.0 / 8000.0));
    let MessageBody::RtpReceive(packet) = first.body() else {
        panic!("not an rtp receive message");
    };
    assert_eq!(packet.payload.as_ref(), b"payload-a");
    assert!(packet.marker);

    let second = stage.pull(&ctx).expect("pull").expect("second message");
    let MessageBody::RtpReceive(packet) = second.body() else {
        panic!("not an rtp receive message");
    };
    assert_eq!(packet.payload.as_ref(), b"payload-b");

    assert!(stage.pull(&ctx).expect("pull").is_none());
}
