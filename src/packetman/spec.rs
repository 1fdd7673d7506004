use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

/// Maximum TCP options length (40 bytes, per the 4-bit data offset field).
pub const MAX_TCP_OPTIONS_LEN: usize = 40;

/// A named packet-transformation recipe, as deserialized from operator
/// configuration. The outer `Packets` list is the ordered set of packets to
/// emit in place of the intercepted SYN-ACK; each starts as a copy of the
/// original and has its steps applied in order.
#[derive(Debug, Clone, Deserialize)]
pub struct Spec {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Packets")]
    pub packets: Vec<Vec<TransformStep>>,
}

#[derive(Debug, Clone, Deserialize)]
pub enum TransformStep {
    /// Replace the TCP flags with the named set. Letters: F,S,R,P,A,U,E,C.
    Flags(String),
    /// Set or replace a TCP option by kind; `Value` is hex-encoded option
    /// data (may be empty for flag-style options).
    SetOption {
        #[serde(rename = "Kind")]
        kind: u8,
        #[serde(rename = "Value")]
        value: String,
    },
    /// Remove a TCP option by kind.
    OmitOption(u8),
    /// Attach a hex-encoded payload to the emitted packet.
    Payload(String),
    /// Add a signed offset to the sequence number.
    Seq(i64),
    /// Add a signed offset to the acknowledgment number.
    Ack(i64),
    /// Override the IPv4 TTL / IPv6 hop limit.
    Ttl(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFlagSet {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

#[derive(Debug, Clone)]
pub enum CompiledStep {
    Flags(TcpFlagSet),
    SetOption { kind: u8, value: Vec<u8> },
    OmitOption(u8),
    Payload(Vec<u8>),
    Seq(i64),
    Ack(i64),
    Ttl(u8),
}

/// Immutable, validated form of a Spec. Shared between the registry and any
/// in-flight transformation; replacing the registry does not invalidate
/// references already taken.
#[derive(Debug)]
pub struct CompiledSpec {
    pub name: String,
    pub packets: Vec<Vec<CompiledStep>>,
}

fn decode_hex(hex: &str) -> std::io::Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("odd-length hex value: {}", hex),
        ));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid hex value: {}", hex),
                )
            })
        })
        .collect()
}

fn parse_flags(letters: &str) -> std::io::Result<TcpFlagSet> {
    let mut flags = TcpFlagSet {
        fin: false,
        syn: false,
        rst: false,
        psh: false,
        ack: false,
        urg: false,
        ece: false,
        cwr: false,
    };
    for letter in letters.chars() {
        match letter {
            'F' => flags.fin = true,
            'S' => flags.syn = true,
            'R' => flags.rst = true,
            'P' => flags.psh = true,
            'A' => flags.ack = true,
            'U' => flags.urg = true,
            'E' => flags.ece = true,
            'C' => flags.cwr = true,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid TCP flag letter: {}", letter),
                ));
            }
        }
    }
    Ok(flags)
}

fn compile_step(step: &TransformStep) -> std::io::Result<CompiledStep> {
    match step {
        TransformStep::Flags(letters) => Ok(CompiledStep::Flags(parse_flags(letters)?)),
        TransformStep::SetOption { kind, value } => {
            if *kind < 2 {
                // Kinds 0 (EOL) and 1 (NOP) are padding, not settable options.
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid TCP option kind: {}", kind),
                ));
            }
            let value = decode_hex(value)?;
            if value.len() + 2 > MAX_TCP_OPTIONS_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "TCP option value too long",
                ));
            }
            Ok(CompiledStep::SetOption { kind: *kind, value })
        }
        TransformStep::OmitOption(kind) => Ok(CompiledStep::OmitOption(*kind)),
        TransformStep::Payload(hex) => Ok(CompiledStep::Payload(decode_hex(hex)?)),
        TransformStep::Seq(offset) => Ok(CompiledStep::Seq(*offset)),
        TransformStep::Ack(offset) => Ok(CompiledStep::Ack(*offset)),
        TransformStep::Ttl(ttl) => Ok(CompiledStep::Ttl(*ttl)),
    }
}

pub fn compile_spec(spec: &Spec) -> std::io::Result<CompiledSpec> {
    if spec.name.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "invalid spec name",
        ));
    }
    if spec.packets.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("spec {} emits no packets", spec.name),
        ));
    }

    let mut packets = Vec::with_capacity(spec.packets.len());
    for steps in &spec.packets {
        let compiled: Vec<CompiledStep> = steps
            .iter()
            .map(compile_step)
            .collect::<std::io::Result<_>>()
            .map_err(|e| {
                std::io::Error::new(e.kind(), format!("spec {}: {}", spec.name, e))
            })?;

        // Each TCP option kind may be named at most once per packet; a
        // second SetOption/OmitOption for the same kind is a conflicting
        // directive, rejected here rather than silently merged at apply
        // time.
        let mut seen_kinds = std::collections::HashSet::new();
        for step in &compiled {
            let kind = match step {
                CompiledStep::SetOption { kind, .. } => Some(*kind),
                CompiledStep::OmitOption(kind) => Some(*kind),
                _ => None,
            };
            if let Some(kind) = kind {
                if !seen_kinds.insert(kind) {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("spec {}: duplicate TCP option kind: {}", spec.name, kind),
                    ));
                }
            }
        }

        packets.push(compiled);
    }

    Ok(CompiledSpec {
        name: spec.name.clone(),
        packets,
    })
}

/// Compile a full spec set into a registry map. Fails without side effects
/// on the first invalid spec, so the caller can retain its previous
/// registry.
pub fn compile_specs(
    specs: &[Spec],
) -> std::io::Result<HashMap<String, Arc<CompiledSpec>>> {
    let mut compiled = HashMap::with_capacity(specs.len());
    for spec in specs {
        let compiled_spec = compile_spec(spec)?;
        if compiled
            .insert(spec.name.clone(), Arc::new(compiled_spec))
            .is_some()
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("duplicate spec name: {}", spec.name),
            ));
        }
    }
    Ok(compiled)
}

/// Parse a JSON array of specs, the operator configuration format.
pub fn parse_specs_json(json: &str) -> std::io::Result<Vec<Spec>> {
    serde_json::from_str(json)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("invalid spec JSON: {}", e)))
}
