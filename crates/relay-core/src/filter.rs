//! ICE candidate filtering.
//!
//! Candidates advertising loopback or private-range addresses are useless to
//! a remote peer and leak internal topology, so they are never relayed.

use std::net::{IpAddr, Ipv6Addr};

/// Rejects candidates that encode a non-routable address.
///
/// Every whitespace-separated token of the candidate line is inspected, so
/// the related address (`raddr`) of a reflexive candidate counts too.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateFilter;

impl CandidateFilter {
    /// Create a filter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Whether `candidate` may be forwarded.
    #[must_use]
    pub fn allows(&self, candidate: &str) -> bool {
        !candidate.split_whitespace().any(is_private_token)
    }

    /// Drop every `a=candidate` line of `sdp` that [`allows`](Self::allows)
    /// rejects. Other lines are kept byte for byte.
    #[must_use]
    pub fn scrub_sdp(&self, sdp: &str) -> String {
        sdp.split_inclusive('\n')
            .filter(|line| {
                let attribute = line.trim_start();
                !attribute.starts_with("a=candidate:") || self.allows(attribute)
            })
            .collect()
    }
}

fn is_private_token(token: &str) -> bool {
    if token.eq_ignore_ascii_case("localhost") {
        return true;
    }

    let token = token.trim_start_matches('[').trim_end_matches(']');
    match token.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || is_unique_local(&ip),
        Err(_) => false,
    }
}

/// `fc00::/7`
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ip: &str) -> String {
        format!("candidate:1 1 udp 2130706431 {ip} 54321 typ host")
    }

    #[test]
    fn test_rejects_private_ranges() {
        let filter = CandidateFilter::new();
        for ip in [
            "127.0.0.1",
            "10.0.0.7",
            "172.16.0.1",
            "172.31.255.254",
            "192.168.1.5",
            "::1",
            "fd12:3456::1",
        ] {
            assert!(!filter.allows(&host(ip)), "{ip} should be rejected");
        }
        assert!(!filter.allows(&host("localhost")));
        assert!(!filter.allows(&host("LOCALHOST")));
    }

    #[test]
    fn test_allows_public_addresses() {
        let filter = CandidateFilter::new();
        for ip in ["203.0.113.9", "110.0.0.1", "172.32.0.1", "192.169.0.1", "2001:db8::1"] {
            assert!(filter.allows(&host(ip)), "{ip} should be allowed");
        }
    }

    #[test]
    fn test_checks_related_address() {
        let filter = CandidateFilter::new();
        let srflx = "candidate:2 1 udp 1694498815 203.0.113.9 61000 typ srflx raddr 192.168.0.4 rport 61000";
        assert!(!filter.allows(srflx));

        let public = "candidate:2 1 udp 1694498815 203.0.113.9 61000 typ srflx raddr 0.0.0.0 rport 0";
        assert!(filter.allows(public));
    }

    #[test]
    fn test_scrub_sdp_drops_private_candidate_lines() {
        let filter = CandidateFilter::new();
        let sdp = "v=0\r\n\
                   m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
                   a=candidate:1 1 udp 2130706431 192.168.1.5 50064 typ host\r\n\
                   a=candidate:2 1 udp 1694498815 203.0.113.7 50064 typ srflx raddr 0.0.0.0 rport 0\r\n\
                   a=candidate:3 1 udp 2130706431 127.0.0.1 50065 typ host\r\n\
                   a=end-of-candidates\r\n";

        let scrubbed = filter.scrub_sdp(sdp);
        assert_eq!(
            scrubbed,
            "v=0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
             a=candidate:2 1 udp 1694498815 203.0.113.7 50064 typ srflx raddr 0.0.0.0 rport 0\r\n\
             a=end-of-candidates\r\n"
        );
    }

    #[test]
    fn test_scrub_sdp_without_candidates_unchanged() {
        let filter = CandidateFilter::new();
        assert_eq!(filter.scrub_sdp("v=0\r\ns=-\r\n"), "v=0\r\ns=-\r\n");
        assert_eq!(filter.scrub_sdp("answer"), "answer");
    }

    #[test]
    fn test_non_address_tokens_ignored() {
        let filter = CandidateFilter::new();
        assert!(filter.allows(""));
        assert!(filter.allows("candidate:3 1 udp 2130706431 9b1c.local 5000 typ host"));
    }
}
