//! Transport-layer statistics sampled at send time.
//!
//! ABR algorithms consume a per-send snapshot of the congestion state of
//! the client's TCP connection. On Linux this reads `TCP_INFO`; elsewhere
//! sampling reports unsupported and sessions carry no snapshot.

use std::io;

/// Snapshot of a connection's congestion state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpInfo {
    /// Congestion window, in packets.
    pub cwnd: u32,
    /// Packets sent and not yet cumulatively acked, less sacked/lost.
    pub in_flight: u32,
    /// Minimum observed RTT (microseconds).
    pub min_rtt_us: u32,
    /// Smoothed RTT (microseconds).
    pub rtt_us: u32,
    /// Delivery rate estimate (bytes per second).
    pub delivery_rate: u64,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::TcpInfo;
    use std::io;
    use std::os::fd::RawFd;

    /// `struct tcp_info` from linux/tcp.h, through `tcpi_delivery_rate`.
    /// The kernel copies out at most the length we pass; fields beyond what
    /// the running kernel provides stay zero.
    #[repr(C)]
    #[derive(Default)]
    struct TcpInfoRaw {
        tcpi_state: u8,
        tcpi_ca_state: u8,
        tcpi_retransmits: u8,
        tcpi_probes: u8,
        tcpi_backoff: u8,
        tcpi_options: u8,
        tcpi_wscale: u8,
        tcpi_app_limited: u8,

        tcpi_rto: u32,
        tcpi_ato: u32,
        tcpi_snd_mss: u32,
        tcpi_rcv_mss: u32,

        tcpi_unacked: u32,
        tcpi_sacked: u32,
        tcpi_lost: u32,
        tcpi_retrans: u32,
        tcpi_fackets: u32,

        tcpi_last_data_sent: u32,
        tcpi_last_ack_sent: u32,
        tcpi_last_data_recv: u32,
        tcpi_last_ack_recv: u32,

        tcpi_pmtu: u32,
        tcpi_rcv_ssthresh: u32,
        tcpi_rtt: u32,
        tcpi_rttvar: u32,
        tcpi_snd_ssthresh: u32,
        tcpi_snd_cwnd: u32,
        tcpi_advmss: u32,
        tcpi_reordering: u32,

        tcpi_rcv_rtt: u32,
        tcpi_rcv_space: u32,

        tcpi_total_retrans: u32,

        tcpi_pacing_rate: u64,
        tcpi_max_pacing_rate: u64,
        tcpi_bytes_acked: u64,
        tcpi_bytes_received: u64,
        tcpi_segs_out: u32,
        tcpi_segs_in: u32,

        tcpi_notsent_bytes: u32,
        tcpi_min_rtt: u32,
        tcpi_data_segs_in: u32,
        tcpi_data_segs_out: u32,

        tcpi_delivery_rate: u64,
    }

    pub fn sample(fd: RawFd) -> io::Result<TcpInfo> {
        let mut raw = TcpInfoRaw::default();
        let mut len = std::mem::size_of::<TcpInfoRaw>() as libc::socklen_t;

        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                (&mut raw as *mut TcpInfoRaw).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let in_flight = raw
            .tcpi_unacked
            .saturating_sub(raw.tcpi_sacked + raw.tcpi_lost)
            .saturating_add(raw.tcpi_retrans);

        Ok(TcpInfo {
            cwnd: raw.tcpi_snd_cwnd,
            in_flight,
            min_rtt_us: raw.tcpi_min_rtt,
            rtt_us: raw.tcpi_rtt,
            delivery_rate: raw.tcpi_delivery_rate,
        })
    }
}

/// Samples `TCP_INFO` for a connected socket.
#[cfg(target_os = "linux")]
pub fn sample_tcp_info(fd: std::os::fd::RawFd) -> io::Result<TcpInfo> {
    imp::sample(fd)
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn sample_tcp_info(_fd: std::os::fd::RawFd) -> io::Result<TcpInfo> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP_INFO sampling requires Linux",
    ))
}
