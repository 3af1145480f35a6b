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

use crate::error::ConfigResult;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpSessionConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// RTP port; RTCP uses the next port up. 0 picks a free even/odd pair.
    #[serde(default)]
    pub rtp_port: u16,
    /// RTP targets. RTCP reports go to the same hosts one port up.
    #[serde(default)]
    pub destinations: Vec<SocketAddr>,
    /// Multicast group to join for reception.
    #[serde(default)]
    pub multicast_group: Option<Ipv4Addr>,
    /// Canonical name announced via RTCP SDES, grouping this session's
    /// streams for inter-stream synchronization at the receivers.
    #[serde(default = "default_cname")]
    pub cname: String,
    /// RTP clock rate of the outgoing stream, used to advance the sender
    /// report's RTP timestamp between packets.
    #[serde(default = "default_clock_rate")]
    pub clock_rate: u32,
    /// Clock rates of expected incoming payload types. Sources with an
    /// unlisted payload type fall back to the unit estimated from their
    /// sender reports.
    #[serde(default)]
    pub payload_clock_rates: HashMap<u8, u32>,
    /// Interval between outgoing RTCP sender reports.
    #[serde(default = "default_report_interval", with = "serde_millis")]
    pub report_interval: Duration,
}

impl Default for UdpSessionConfig {
    fn default() -> Self {
        UdpSessionConfig {
            bind_address: default_bind_address(),
            rtp_port: 0,
            destinations: Vec::new(),
            multicast_group: None,
            cname: default_cname(),
            clock_rate: default_clock_rate(),
            payload_clock_rates: HashMap::new(),
            report_interval: default_report_interval(),
        }
    }
}

impl UdpSessionConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let yaml = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&yaml)?)
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_cname() -> String {
    format!("moip-{:08x}@localhost", rand::random::<u32>())
}

fn default_clock_rate() -> u32 {
    48_000
}

fn default_report_interval() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_yaml_uses_defaults() {
        let config: UdpSessionConfig =
            serde_yaml::from_str("rtpPort: 5004\n").expect("parseable config");
        assert_eq!(config.rtp_port, 5004);
        assert_eq!(config.clock_rate, 48_000);
        assert_eq!(config.report_interval, Duration::from_secs(5));
        assert!(config.destinations.is_empty());
    }

    #[test]
    fn full_yaml_round_trips() {
        let yaml = r#"
bindAddress: 127.0.0.1
rtpPort: 6000
destinations:
  - 127.0.0.1:6002
cname: test@example
clockRate: 8000
payloadClockRates:
  0: 8000
reportInterval: 1000
"#;
        let config: UdpSessionConfig = serde_yaml::from_str(yaml).expect("parseable config");
        assert_eq!(config.clock_rate, 8000);
        assert_eq!(config.payload_clock_rates.get(&0), Some(&8000));
        assert_eq!(config.report_interval, Duration::from_secs(1));
        assert_eq!(config.destinations.len(), 1);
    }
}
