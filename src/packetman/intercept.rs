//! Packet-intercept provider abstraction.
//!
//! The kernel-facing side of the transformer is isolated behind a small
//! provider trait so the data plane is portable and testable: Linux gets a
//! netfilter-queue implementation, everything else an Unsupported stub, and
//! tests drive the full verdict flow with an in-memory provider.

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    Accept,
    Drop,
}

#[derive(Debug, Clone)]
pub struct InterceptConfig {
    pub queue_number: u16,
    /// TCP source ports whose SYN-ACKs are routed into the queue.
    pub ports: Vec<u16>,
    /// Mark carried by injected packets; the filter excludes it to prevent
    /// intercept loops.
    pub socket_mark: u32,
    pub allow_no_ipv6: bool,
    pub use_sudo: bool,
    /// Intercepted SYN-ACKs carry no payload, so a single MTU suffices.
    pub max_packet_len: u32,
    /// Larger than the kernel default of 1024 to accommodate bursts of
    /// concurrent handshakes.
    pub max_queue_len: u32,
    /// Netlink receive buffer, well above the typical 212992 default to
    /// avoid ENOBUFS under load.
    pub recv_buffer_size: usize,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            queue_number: 0,
            ports: Vec::new(),
            socket_mark: 0,
            allow_no_ipv6: false,
            use_sudo: false,
            max_packet_len: 1500,
            max_queue_len: 2048,
            recv_buffer_size: 1_703_936,
        }
    }
}

pub struct InterceptedPacket {
    pub data: Vec<u8>,
}

/// Handler invoked for each intercepted packet. The returned value is the
/// packet's verdict, which the provider issues immediately; exactly one
/// verdict per delivered packet, by construction.
pub type InterceptCallback =
    Box<dyn FnMut(InterceptedPacket) -> PacketVerdict + Send + 'static>;

pub trait InterceptProvider: Send + Sync {
    /// Begin interception. Returns once the queue is bound and packets are
    /// flowing to the callback; the provider owns the I/O thread.
    fn open(
        &self,
        config: &InterceptConfig,
        callback: InterceptCallback,
    ) -> io::Result<Box<dyn InterceptHandle>>;
}

pub trait InterceptHandle: Send {
    /// Stop interception and release kernel resources. Blocks until
    /// in-flight verdicts have drained.
    fn close(&mut self) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
pub use linux::NfqueueProvider;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// How long close() waits after signalling stop, giving the queue
    /// thread a chance to finish issuing verdicts for in-flight packets.
    const CLOSE_GRACE_DELAY: Duration = Duration::from_millis(100);

    /// Poll interval for the non-blocking receive loop. Netlink read
    /// timeouts are avoided entirely (they have been observed to orphan
    /// queued packets); instead the socket is non-blocking and the thread
    /// parks briefly between empty polls.
    const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

    pub struct NfqueueProvider;

    struct NfqueueHandle {
        stop: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
        net_config: crate::packetman::netconfig::NetConfig,
    }

    fn net_config(config: &InterceptConfig) -> crate::packetman::netconfig::NetConfig {
        crate::packetman::netconfig::NetConfig {
            ports: config.ports.clone(),
            queue_number: config.queue_number,
            socket_mark: config.socket_mark,
            allow_no_ipv6: config.allow_no_ipv6,
            use_sudo: config.use_sudo,
        }
    }

    impl InterceptProvider for NfqueueProvider {
        fn open(
            &self,
            config: &InterceptConfig,
            mut callback: InterceptCallback,
        ) -> io::Result<Box<dyn InterceptHandle>> {
            let net_config = net_config(config);
            crate::packetman::netconfig::install(&net_config)?;

            let open_queue = || -> io::Result<nfq::Queue> {
                let mut queue = nfq::Queue::open()?;
                queue.bind(config.queue_number)?;
                Ok(queue)
            };
            let mut queue = match open_queue() {
                Ok(queue) => queue,
                Err(e) => {
                    crate::packetman::netconfig::remove(&net_config);
                    return Err(e);
                }
            };

            // Equivalent of the iptables queue-bypass flag at the queue
            // level: if this process stalls, packets pass unmodified.
            if let Err(e) = queue.set_fail_open(config.queue_number, true) {
                crate::packetman::netconfig::remove(&net_config);
                return Err(e);
            }

            queue.set_nonblocking(true);

            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = stop.clone();
            let queue_number = config.queue_number;

            let thread = std::thread::Builder::new()
                .name("synack-intercept".to_string())
                .spawn(move || {
                    loop {
                        match queue.recv() {
                            Ok(mut msg) => {
                                let packet = InterceptedPacket {
                                    data: msg.get_payload().to_vec(),
                                };
                                let verdict = callback(packet);
                                msg.set_verdict(match verdict {
                                    PacketVerdict::Accept => nfq::Verdict::Accept,
                                    PacketVerdict::Drop => nfq::Verdict::Drop,
                                });
                                if let Err(e) = queue.verdict(msg) {
                                    log::warn!("nfqueue verdict failed: {}", e);
                                }
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                if thread_stop.load(Ordering::Acquire) {
                                    break;
                                }
                                std::thread::sleep(IDLE_POLL_INTERVAL);
                            }
                            Err(e) => {
                                log::warn!("nfqueue recv failed: {}", e);
                                if thread_stop.load(Ordering::Acquire) {
                                    break;
                                }
                                std::thread::sleep(IDLE_POLL_INTERVAL);
                            }
                        }
                    }
                    if let Err(e) = queue.unbind(queue_number) {
                        log::warn!("nfqueue unbind failed: {}", e);
                    }
                })?;

            Ok(Box::new(NfqueueHandle {
                stop,
                thread: Some(thread),
                net_config,
            }))
        }
    }

    impl InterceptHandle for NfqueueHandle {
        fn close(&mut self) -> io::Result<()> {
            // Remove the filter first so no new packets enter the queue,
            // then give in-flight verdicts a grace period to drain.
            crate::packetman::netconfig::remove(&self.net_config);
            self.stop.store(true, Ordering::Release);
            std::thread::sleep(CLOSE_GRACE_DELAY);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
            Ok(())
        }
    }
}

/// Stub for platforms without netfilter queues.
pub struct UnsupportedProvider;

impl InterceptProvider for UnsupportedProvider {
    fn open(
        &self,
        _config: &InterceptConfig,
        _callback: InterceptCallback,
    ) -> io::Result<Box<dyn InterceptHandle>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "packet interception is not supported on this platform",
        ))
    }
}

/// Default provider for the current platform.
pub fn platform_provider() -> Box<dyn InterceptProvider> {
    #[cfg(target_os = "linux")]
    {
        Box::new(NfqueueProvider)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnsupportedProvider)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory provider: feeds a fixed set of packets through the
    /// callback synchronously on open() and records the verdicts.
    pub struct FakeProvider {
        pub packets: Mutex<Vec<Vec<u8>>>,
        pub verdicts: Arc<Mutex<Vec<PacketVerdict>>>,
    }

    impl FakeProvider {
        pub fn new(packets: Vec<Vec<u8>>) -> Self {
            Self {
                packets: Mutex::new(packets),
                verdicts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct FakeHandle;

    impl InterceptHandle for FakeHandle {
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl InterceptProvider for FakeProvider {
        fn open(
            &self,
            _config: &InterceptConfig,
            mut callback: InterceptCallback,
        ) -> io::Result<Box<dyn InterceptHandle>> {
            let packets: Vec<Vec<u8>> = self.packets.lock().drain(..).collect();
            for data in packets {
                let verdict = callback(InterceptedPacket { data });
                self.verdicts.lock().push(verdict);
            }
            Ok(Box::new(FakeHandle))
        }
    }
}
