//! Parsing and rewriting of intercepted SYN-ACK packets.
//!
//! The intercept filter hands us a raw IP packet (no link layer). Parsing is
//! strict: anything that is not a payload-free SYN-ACK is an error, and the
//! caller fails open by releasing the original packet.

use std::net::IpAddr;

use etherparse::{Ipv4Header, Ipv6Header, NetHeaders, PacketHeaders, PayloadSlice, TcpHeader};

use super::spec::{CompiledSpec, CompiledStep, TcpFlagSet, MAX_TCP_OPTIONS_LEN};

#[derive(Debug, Clone)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

/// An intercepted SYN-ACK in canonical form (end-of-option-list padding
/// stripped), ready for transformation.
#[derive(Debug, Clone)]
pub struct ParsedSynAck {
    pub ip: IpHeader,
    pub tcp: TcpHeader,
}

impl ParsedSynAck {
    pub fn source_ip(&self) -> IpAddr {
        match &self.ip {
            IpHeader::V4(v4) => IpAddr::from(v4.source),
            IpHeader::V6(v6) => IpAddr::from(v6.source),
        }
    }

    pub fn destination_ip(&self) -> IpAddr {
        match &self.ip {
            IpHeader::V4(v4) => IpAddr::from(v4.destination),
            IpHeader::V6(v6) => IpAddr::from(v6.destination),
        }
    }

    pub fn source_port(&self) -> u16 {
        self.tcp.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.tcp.destination_port
    }
}

/// Walk raw TCP options, returning (kind, full option bytes) entries up to
/// the end-of-option-list marker. Errors on truncated options.
fn parse_options(raw: &[u8]) -> std::io::Result<Vec<(u8, Vec<u8>)>> {
    let mut options = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let kind = raw[pos];
        match kind {
            0 => break, // end of option list; the remainder is padding
            1 => {
                options.push((1, vec![1]));
                pos += 1;
            }
            _ => {
                if pos + 1 >= raw.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "truncated TCP option",
                    ));
                }
                let len = raw[pos + 1] as usize;
                if len < 2 || pos + len > raw.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "invalid TCP option length",
                    ));
                }
                options.push((kind, raw[pos..pos + len].to_vec()));
                pos += len;
            }
        }
    }
    Ok(options)
}

/// Serialize options, padding with NOPs to a 4-byte boundary.
fn encode_options(options: &[(u8, Vec<u8>)]) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(MAX_TCP_OPTIONS_LEN);
    for (_, bytes) in options {
        raw.extend_from_slice(bytes);
    }
    while raw.len() % 4 != 0 {
        raw.push(1);
    }
    if raw.len() > MAX_TCP_OPTIONS_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "transformed TCP options exceed 40 bytes",
        ));
    }
    Ok(raw)
}

fn set_options(tcp: &mut TcpHeader, raw: &[u8]) -> std::io::Result<()> {
    tcp.set_options_raw(raw).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to set TCP options: {:?}", e),
        )
    })
}

/// Strip end-of-option-list padding so transforms operate on a canonical
/// option list.
fn strip_eol_padding(tcp: &mut TcpHeader) -> std::io::Result<()> {
    let raw = tcp.options.as_slice().to_vec();
    let options = parse_options(&raw)?;
    let canonical = encode_options(&options)?;
    if canonical != raw {
        set_options(tcp, &canonical)?;
    }
    Ok(())
}

/// Parse an intercepted packet, requiring an IPv4 or IPv6 header followed by
/// a payload-free TCP header with exactly SYN and ACK set (the ECN flags
/// ECE/CWR/NS may also be set and are retained).
pub fn parse_syn_ack(packet_data: &[u8]) -> std::io::Result<ParsedSynAck> {
    let headers = PacketHeaders::from_ip_slice(packet_data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}", e)))?;

    let ip = match headers.net {
        Some(NetHeaders::Ipv4(v4, _)) => IpHeader::V4(v4),
        Some(NetHeaders::Ipv6(v6, _)) => IpHeader::V6(v6),
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "missing IP layer",
            ));
        }
    };

    let mut tcp = match headers.transport {
        Some(etherparse::TransportHeader::Tcp(tcp)) => tcp,
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "missing TCP layer",
            ));
        }
    };

    let payload_empty = match headers.payload {
        PayloadSlice::Tcp(payload) => payload.is_empty(),
        _ => false,
    };
    if !payload_empty {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected payload",
        ));
    }

    if !tcp.syn || !tcp.ack || tcp.fin || tcp.rst || tcp.psh || tcp.urg {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected TCP flags",
        ));
    }

    strip_eol_padding(&mut tcp)?;

    Ok(ParsedSynAck { ip, tcp })
}

fn apply_flags(tcp: &mut TcpHeader, flags: &TcpFlagSet) {
    tcp.fin = flags.fin;
    tcp.syn = flags.syn;
    tcp.rst = flags.rst;
    tcp.psh = flags.psh;
    tcp.ack = flags.ack;
    tcp.urg = flags.urg;
    tcp.ece = flags.ece;
    tcp.cwr = flags.cwr;
}

fn apply_steps(
    ip: &mut IpHeader,
    tcp: &mut TcpHeader,
    steps: &[CompiledStep],
) -> std::io::Result<Vec<u8>> {
    let mut payload = Vec::new();

    for step in steps {
        match step {
            CompiledStep::Flags(flags) => apply_flags(tcp, flags),
            CompiledStep::SetOption { kind, value } => {
                let mut encoded = Vec::with_capacity(value.len() + 2);
                encoded.push(*kind);
                encoded.push((value.len() + 2) as u8);
                encoded.extend_from_slice(value);

                // The spec compiler rejects two steps naming one kind, so a
                // match here is always an option carried by the intercepted
                // packet itself, which this directive replaces in place.
                let mut options = parse_options(tcp.options.as_slice())?;
                match options.iter_mut().find(|(k, _)| k == kind) {
                    Some(existing) => existing.1 = encoded,
                    None => options.push((*kind, encoded)),
                }
                let raw = encode_options(&options)?;
                set_options(tcp, &raw)?;
            }
            CompiledStep::OmitOption(kind) => {
                let mut options = parse_options(tcp.options.as_slice())?;
                options.retain(|(k, _)| k != kind);
                let raw = encode_options(&options)?;
                set_options(tcp, &raw)?;
            }
            CompiledStep::Payload(data) => {
                payload = data.clone();
            }
            CompiledStep::Seq(offset) => {
                tcp.sequence_number = tcp.sequence_number.wrapping_add(*offset as u32);
            }
            CompiledStep::Ack(offset) => {
                tcp.acknowledgment_number = tcp.acknowledgment_number.wrapping_add(*offset as u32);
            }
            CompiledStep::Ttl(ttl) => match ip {
                IpHeader::V4(v4) => v4.time_to_live = *ttl,
                IpHeader::V6(v6) => v6.hop_limit = *ttl,
            },
        }
    }

    Ok(payload)
}

/// Serialize a transformed packet with recomputed lengths and checksums.
fn serialize(ip: &mut IpHeader, tcp: &mut TcpHeader, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let tcp_len = tcp.header_len() as usize + payload.len();

    let mut out = Vec::with_capacity(40 + tcp_len);
    match ip {
        IpHeader::V4(v4) => {
            v4.set_payload_len(tcp_len).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}", e))
            })?;
            tcp.checksum = tcp.calc_checksum_ipv4(v4, payload).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}", e))
            })?;
            v4.write(&mut out)?;
        }
        IpHeader::V6(v6) => {
            v6.set_payload_length(tcp_len).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}", e))
            })?;
            tcp.checksum = tcp.calc_checksum_ipv6(v6, payload).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}", e))
            })?;
            v6.write(&mut out)?;
        }
    }
    tcp.write(&mut out)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Apply a compiled spec to a parsed SYN-ACK, producing the raw packets to
/// inject in place of the original.
pub fn apply_spec(spec: &CompiledSpec, parsed: &ParsedSynAck) -> std::io::Result<Vec<Vec<u8>>> {
    let mut packets = Vec::with_capacity(spec.packets.len());
    for steps in &spec.packets {
        let mut ip = parsed.ip.clone();
        let mut tcp = parsed.tcp.clone();
        let payload = apply_steps(&mut ip, &mut tcp, steps)?;
        packets.push(serialize(&mut ip, &mut tcp, &payload)?);
    }
    Ok(packets)
}

#[cfg(test)]
pub(crate) fn build_test_syn_ack(
    src: std::net::Ipv4Addr,
    src_port: u16,
    dst: std::net::Ipv4Addr,
    dst_port: u16,
) -> Vec<u8> {
    let mut tcp = TcpHeader::new(src_port, dst_port, 0x1000_0000, 65535);
    tcp.syn = true;
    tcp.ack = true;
    tcp.acknowledgment_number = 0x2000_0001;
    tcp.set_options_raw(&[2, 4, 0x05, 0xb4]).unwrap();

    let ipv4 = Ipv4Header::new(
        tcp.header_len() as u16,
        64,
        etherparse::IpNumber::TCP,
        src.octets(),
        dst.octets(),
    )
    .unwrap();
    tcp.checksum = tcp.calc_checksum_ipv4(&ipv4, &[]).unwrap();

    let mut out = Vec::new();
    ipv4.write(&mut out).unwrap();
    tcp.write(&mut out).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packetman::spec::{compile_spec, Spec, TransformStep};

    fn sample_packet() -> Vec<u8> {
        build_test_syn_ack(
            "10.0.0.1".parse().unwrap(),
            443,
            "10.0.0.2".parse().unwrap(),
            5000,
        )
    }

    #[test]
    fn test_parse_syn_ack() {
        let parsed = parse_syn_ack(&sample_packet()).unwrap();
        assert_eq!(parsed.source_ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.source_port(), 443);
        assert_eq!(parsed.destination_port(), 5000);
        assert!(parsed.tcp.syn && parsed.tcp.ack);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let garbage = [0x42u8; 20];
        assert!(parse_syn_ack(&garbage).is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_flags() {
        let mut packet = sample_packet();
        let parsed = parse_syn_ack(&packet).unwrap();
        // Rebuild with RST set.
        let mut tcp = parsed.tcp.clone();
        tcp.rst = true;
        let mut ip = parsed.ip.clone();
        packet = serialize(&mut ip, &mut tcp, &[]).unwrap();
        assert!(parse_syn_ack(&packet).is_err());
    }

    #[test]
    fn test_noop_spec_round_trips() {
        let spec = compile_spec(&Spec {
            name: "noop".to_string(),
            packets: vec![vec![]],
        })
        .unwrap();
        let original = sample_packet();
        let parsed = parse_syn_ack(&original).unwrap();
        let packets = apply_spec(&spec, &parsed).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], original);
    }

    #[test]
    fn test_flag_and_option_transforms() {
        let spec = compile_spec(&Spec {
            name: "mangle".to_string(),
            packets: vec![vec![
                TransformStep::Flags("SAE".to_string()),
                TransformStep::OmitOption(2),
                TransformStep::SetOption {
                    kind: 3,
                    value: "07".to_string(),
                },
                TransformStep::Ttl(32),
            ]],
        })
        .unwrap();

        let parsed = parse_syn_ack(&sample_packet()).unwrap();
        let packets = apply_spec(&spec, &parsed).unwrap();
        let headers = PacketHeaders::from_ip_slice(&packets[0]).unwrap();
        let tcp = match headers.transport {
            Some(etherparse::TransportHeader::Tcp(tcp)) => tcp,
            _ => panic!("missing tcp"),
        };
        assert!(tcp.syn && tcp.ack && tcp.ece);
        let options = parse_options(tcp.options.as_slice()).unwrap();
        assert!(!options.iter().any(|(k, _)| *k == 2));
        assert!(options.iter().any(|(k, _)| *k == 3));
        match headers.net {
            Some(NetHeaders::Ipv4(v4, _)) => assert_eq!(v4.time_to_live, 32),
            _ => panic!("missing ipv4"),
        }
    }

    #[test]
    fn test_payload_and_split() {
        let spec = compile_spec(&Spec {
            name: "split".to_string(),
            packets: vec![
                vec![],
                vec![
                    TransformStep::Payload("00010203".to_string()),
                    TransformStep::Seq(1),
                ],
            ],
        })
        .unwrap();

        let parsed = parse_syn_ack(&sample_packet()).unwrap();
        let packets = apply_spec(&spec, &parsed).unwrap();
        assert_eq!(packets.len(), 2);
        assert!(packets[1].len() > packets[0].len());

        let headers = PacketHeaders::from_ip_slice(&packets[1]).unwrap();
        match headers.payload {
            PayloadSlice::Tcp(payload) => assert_eq!(payload, &[0, 1, 2, 3]),
            _ => panic!("missing payload"),
        }
        let tcp = match headers.transport {
            Some(etherparse::TransportHeader::Tcp(tcp)) => tcp,
            _ => panic!("missing tcp"),
        };
        assert_eq!(tcp.sequence_number, parsed.tcp.sequence_number.wrapping_add(1));
    }

    #[test]
    fn test_eol_padding_stripped() {
        // Options: MSS followed by EOL padding to the word boundary.
        let mut tcp = TcpHeader::new(443, 5000, 1, 65535);
        tcp.syn = true;
        tcp.ack = true;
        tcp.set_options_raw(&[3, 3, 7, 0, 0, 0, 0, 0]).unwrap();
        let ipv4 = Ipv4Header::new(
            tcp.header_len() as u16,
            64,
            etherparse::IpNumber::TCP,
            [10, 0, 0, 1],
            [10, 0, 0, 2],
        )
        .unwrap();
        tcp.checksum = tcp.calc_checksum_ipv4(&ipv4, &[]).unwrap();
        let mut packet = Vec::new();
        ipv4.write(&mut packet).unwrap();
        tcp.write(&mut packet).unwrap();

        let parsed = parse_syn_ack(&packet).unwrap();
        // Canonical form: window-scale option padded with a NOP, no EOL.
        assert_eq!(parsed.tcp.options.as_slice(), &[3, 3, 7, 1]);
    }
}
