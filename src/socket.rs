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

use crate::{config::UdpSessionConfig, error::ConfigResult};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::{info, instrument};

const PORT_PAIR_ATTEMPTS: usize = 16;

/// Creates the RTP/RTCP socket pair for a session: RTP on the configured
/// port, RTCP one port up. With port 0, free pairs are probed until one
/// binds on both ports.
#[instrument(skip(config))]
pub fn create_rtp_socket_pair(config: &UdpSessionConfig) -> ConfigResult<(UdpSocket, UdpSocket)> {
    if config.rtp_port != 0 {
        let rtp = create_udp_socket(
            config.bind_address,
            config.rtp_port,
            config.multicast_group,
        )?;
        let rtcp = create_udp_socket(
            config.bind_address,
            config.rtp_port + 1,
            config.multicast_group,
        )?;
        return Ok((rtp, rtcp));
    }

    for _ in 0..PORT_PAIR_ATTEMPTS {
        let rtp = create_udp_socket(config.bind_address, 0, config.multicast_group)?;
        let rtp_port = rtp.local_addr()?.port();
        if rtp_port == u16::MAX {
            continue;
        }
        match create_udp_socket(config.bind_address, rtp_port + 1, config.multicast_group) {
            Ok(rtcp) => return Ok((rtp, rtcp)),
            Err(_) => continue,
        }
    }

    Err(crate::error::ConfigError::NoFreePortPair)
}

#[instrument]
pub fn create_udp_socket(
    bind_address: IpAddr,
    port: u16,
    multicast_group: Option<Ipv4Addr>,
) -> ConfigResult<UdpSocket> {
    let domain = match bind_address {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;

    if let (Some(group), IpAddr::V4(iface)) = (multicast_group, bind_address) {
        info!("Joining multicast group {group} on {iface}:{port}");
        socket.join_multicast_v4(&group, &iface)?;
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(group), port)))?;
    } else {
        socket.bind(&SockAddr::from(SocketAddr::new(bind_address, port)))?;
    }
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ephemeral_pair_uses_adjacent_ports() {
        let config = UdpSessionConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..UdpSessionConfig::default()
        };
        let (rtp, rtcp) = create_rtp_socket_pair(&config).expect("socket pair");
        let rtp_port = rtp.local_addr().expect("rtp addr").port();
        let rtcp_port = rtcp.local_addr().expect("rtcp addr").port();
        assert_eq!(rtcp_port, rtp_port + 1);
    }
}
