//! Wake-on-LAN delivery.
//!
//! When `waker.wol_exec` is configured the external tool is used (it may
//! need raw-socket privileges we do not have). Without it, the magic
//! packet is broadcast directly over UDP.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::ServiceError;
use crate::exec::{self, CommandOutcome};

pub fn parse_mac(mac: &str) -> Result<[u8; 6], ServiceError> {
    let hex_digits: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex_digits.len() != 12 {
        return Err(ServiceError::Configuration(format!(
            "invalid MAC address: {mac}"
        )));
    }
    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex_digits[i * 2..i * 2 + 2], 16)
            .map_err(|_| ServiceError::Configuration(format!("invalid MAC address: {mac}")))?;
    }
    Ok(out)
}

fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0u8; 102];
    for b in pkt.iter_mut().take(6) {
        *b = 0xFF;
    }
    // 16 repetitions of the MAC after the sync header
    for i in 0..16 {
        let base = 6 + i * 6;
        pkt[base..base + 6].copy_from_slice(&mac);
    }
    pkt
}

fn parse_broadcast(hint: Option<&str>) -> Ipv4Addr {
    if let Some(s) = hint {
        if let Ok(ip) = s.parse::<Ipv4Addr>() {
            return ip;
        }
        warn!("ignoring unparsable broadcast_hint {s:?}");
    }
    Ipv4Addr::new(255, 255, 255, 255)
}

/// Send the wake signal for the configured sleeper.
pub async fn send_wake(cfg: &AppConfig) -> Result<CommandOutcome, ServiceError> {
    match cfg.waker.wol_exec.as_deref() {
        Some(wol_exec) if !wol_exec.trim().is_empty() => {
            let mut argv = shell_words::split(wol_exec).map_err(|e| {
                ServiceError::Configuration(format!("invalid waker.wol_exec: {e}"))
            })?;
            argv.push(cfg.sleeper.mac_address.clone());
            info!(
                "waking {} using {} {}",
                cfg.sleeper.name, wol_exec, cfg.sleeper.mac_address
            );
            let outcome = exec::run(&argv).await?;
            if outcome.returncode != 0 {
                return Err(ServiceError::Command {
                    message: "Wake command failed".to_string(),
                    command: argv.join(" "),
                    returncode: outcome.returncode,
                    stderr: outcome.stderr,
                });
            }
            Ok(outcome)
        }
        _ => {
            info!(
                "waking {} with a native magic packet",
                cfg.sleeper.name
            );
            send_magic_packet(&cfg.sleeper.mac_address, cfg.waker.broadcast_hint.as_deref())
        }
    }
}

/// Broadcast the magic packet over UDP, trying ports 9 then 7.
fn send_magic_packet(
    mac: &str,
    broadcast_hint: Option<&str>,
) -> Result<CommandOutcome, ServiceError> {
    let mac = parse_mac(mac)?;
    let pkt = magic_packet(mac);
    let bcast = parse_broadcast(broadcast_hint);

    let sock = UdpSocket::bind(("0.0.0.0", 0))
        .map_err(|e| ServiceError::Network(format!("WoL socket bind failed: {e}")))?;
    sock.set_broadcast(true)
        .map_err(|e| ServiceError::Network(format!("WoL broadcast mode failed: {e}")))?;

    let mut sent_to = Vec::new();
    for port in [9u16, 7] {
        let addr = SocketAddrV4::new(bcast, port);
        match sock.send_to(&pkt, addr) {
            Ok(_) => sent_to.push(addr.to_string()),
            Err(e) => warn!("WoL send to {addr} failed: {e}"),
        }
    }
    if sent_to.is_empty() {
        return Err(ServiceError::Network(format!(
            "WoL broadcast to {bcast} failed on ports 9 and 7"
        )));
    }
    Ok(CommandOutcome {
        args: vec!["udp-broadcast".to_string(), bcast.to_string()],
        returncode: 0,
        stdout: format!("magic packet sent to {}", sent_to.join(", ")),
        stderr: String::new(),
    })
}
