//! iptables/ip6tables rules routing SYN-ACK packets into the intercept
//! queue.
//!
//! Rules are always deleted before being inserted so repeated starts never
//! accumulate duplicates, and rollback on error attempts removal again.
//! The filter matches locally originated SYN-ACKs from the configured
//! source ports, excludes packets carrying the injection socket mark (the
//! intercept-loop guard), and sets queue-bypass so a stalled queue fails
//! open instead of breaking TCP.

use std::io;
use std::process::Command;

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub ports: Vec<u16>,
    pub queue_number: u16,
    pub socket_mark: u32,
    pub allow_no_ipv6: bool,
    /// Prefix network-config commands with sudo (for unprivileged test
    /// deployments; production servers run with CAP_NET_ADMIN).
    pub use_sudo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    Insert,
    Delete,
}

impl RuleMode {
    fn flag(self) -> &'static str {
        match self {
            RuleMode::Insert => "-I",
            RuleMode::Delete => "-D",
        }
    }
}

/// Build the iptables argument list for one rule operation. Pure, so the
/// exact rule shape is testable without touching the system.
pub fn rule_args(mode: RuleMode, config: &NetConfig) -> Vec<String> {
    let ports = config
        .ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");

    vec![
        mode.flag().to_string(),
        "OUTPUT".to_string(),
        "--protocol".to_string(),
        "tcp".to_string(),
        "--match".to_string(),
        "multiport".to_string(),
        "--source-ports".to_string(),
        ports,
        "--match".to_string(),
        "mark".to_string(),
        "!".to_string(),
        "--mark".to_string(),
        config.socket_mark.to_string(),
        "--tcp-flags".to_string(),
        "ALL".to_string(),
        "SYN,ACK".to_string(),
        "-j".to_string(),
        "NFQUEUE".to_string(),
        "--queue-bypass".to_string(),
        "--queue-num".to_string(),
        config.queue_number.to_string(),
    ]
}

fn run_command(use_sudo: bool, program: &str, args: &[String]) -> io::Result<()> {
    let output = if use_sudo {
        let mut full = vec![program.to_string()];
        full.extend_from_slice(args);
        Command::new("sudo").args(&full).output()?
    } else {
        Command::new(program).args(args).output()?
    };

    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}

fn apply_rules(mode: RuleMode, config: &NetConfig) -> io::Result<()> {
    let args = rule_args(mode, config);

    let result = run_command(config.use_sudo, "iptables", &args);
    if mode == RuleMode::Insert {
        result?;
    }

    let result = run_command(config.use_sudo, "ip6tables", &args);
    if mode == RuleMode::Insert {
        if let Err(e) = result {
            if config.allow_no_ipv6 {
                log::warn!("configure IPv6 NFQUEUE failed: {}", e);
            } else {
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Install the intercept rules, first removing any stale copies.
pub fn install(config: &NetConfig) -> io::Result<()> {
    let _ = apply_rules(RuleMode::Delete, config);
    if let Err(e) = apply_rules(RuleMode::Insert, config) {
        let _ = apply_rules(RuleMode::Delete, config);
        return Err(e);
    }
    Ok(())
}

/// Remove the intercept rules. Errors are ignored; removal of rules that
/// were never inserted is a no-op.
pub fn remove(config: &NetConfig) {
    let _ = apply_rules(RuleMode::Delete, config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_args_shape() {
        let config = NetConfig {
            ports: vec![443, 4433],
            queue_number: 3,
            socket_mark: 0x70736970,
            allow_no_ipv6: false,
            use_sudo: false,
        };
        let args = rule_args(RuleMode::Insert, &config);
        assert_eq!(args[0], "-I");
        assert_eq!(args[1], "OUTPUT");
        assert!(args.contains(&"443,4433".to_string()));
        assert!(args.contains(&format!("{}", 0x70736970u32)));
        assert!(args.contains(&"--queue-bypass".to_string()));
        assert!(args.contains(&"NFQUEUE".to_string()));
        // Mark match must be negated to exclude injected packets.
        let mark_index = args.iter().position(|a| a == "mark").unwrap();
        assert_eq!(args[mark_index + 1], "!");
    }

    #[test]
    fn test_delete_mode_flag() {
        let config = NetConfig {
            ports: vec![443],
            queue_number: 0,
            socket_mark: 1,
            allow_no_ipv6: true,
            use_sudo: false,
        };
        let args = rule_args(RuleMode::Delete, &config);
        assert_eq!(args[0], "-D");
    }
}
