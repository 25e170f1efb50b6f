//! Endpoints, protocols, and URIs.
//!
//! An endpoint is `scheme://host:port`. The scheme selects the wire protocol
//! of one interface: bare RTP, RTP with a FEC footer for protected source
//! streams, or a standalone FEC framing for repair streams.

use anyhow::{bail, Context, Result};

use crate::packet::FecScheme;

/// Wire protocol spoken on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Bare RTP audio.
    Rtp,

    /// RTP audio followed by a Reed-Solomon FEC footer.
    RtpRs8mSource,

    /// Standalone Reed-Solomon repair stream.
    Rs8mRepair,

    /// RTP audio followed by an LDPC-Staircase FEC footer.
    RtpLdpcSource,

    /// Standalone LDPC-Staircase repair stream.
    LdpcRepair,
}

impl Protocol {
    // ---
    /// Returns the FEC scheme implied by the protocol.
    pub fn fec_scheme(self) -> FecScheme {
        // ---
        match self {
            Protocol::Rtp => FecScheme::Disable,
            Protocol::RtpRs8mSource | Protocol::Rs8mRepair => FecScheme::ReedSolomonM8,
            Protocol::RtpLdpcSource | Protocol::LdpcRepair => FecScheme::LdpcStaircase,
        }
    }

    /// Returns whether this protocol carries repair packets.
    pub fn is_repair(self) -> bool {
        matches!(self, Protocol::Rs8mRepair | Protocol::LdpcRepair)
    }

    /// Returns the URI scheme name.
    pub fn scheme(self) -> &'static str {
        // ---
        match self {
            Protocol::Rtp => "rtp",
            Protocol::RtpRs8mSource => "rtp+rs8m",
            Protocol::Rs8mRepair => "rs8m",
            Protocol::RtpLdpcSource => "rtp+ldpc",
            Protocol::LdpcRepair => "ldpc",
        }
    }
}

/// Pipeline interface an endpoint attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// Single interface carrying the whole stream (no FEC).
    Aggregate,

    /// Source (audio) stream interface.
    AudioSource,

    /// Repair stream interface.
    AudioRepair,
}

/// A parsed `scheme://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Wire protocol from the URI scheme.
    pub protocol: Protocol,

    /// Host name or address literal.
    pub host: String,

    /// UDP port; 0 asks the transport to autoselect.
    pub port: u16,
}

impl Endpoint {
    // ---
    /// Parses an endpoint URI.
    ///
    /// # Errors
    ///
    /// Returns error if the scheme is unknown, the port is missing or
    /// malformed, or the host is empty. `rtsp` URIs are rejected: signalling
    /// is outside the pipeline core.
    pub fn from_uri(uri: &str) -> Result<Self> {
        // ---
        let (scheme, rest) = uri
            .split_once("://")
            .with_context(|| format!("invalid endpoint uri: {}", uri))?;

        let protocol = match scheme {
            "rtp" => Protocol::Rtp,
            "rtp+rs8m" => Protocol::RtpRs8mSource,
            "rs8m" => Protocol::Rs8mRepair,
            "rtp+ldpc" => Protocol::RtpLdpcSource,
            "ldpc" => Protocol::LdpcRepair,
            "rtsp" => bail!("rtsp endpoints are not handled by the pipeline core"),
            other => bail!("unknown endpoint scheme: {}", other),
        };

        let (host, port) = rest
            .rsplit_once(':')
            .with_context(|| format!("endpoint uri has no port: {}", uri))?;

        if host.is_empty() {
            bail!("endpoint uri has no host: {}", uri);
        }

        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid endpoint port: {}", port))?;

        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
        })
    }

    /// Formats the endpoint back into a URI.
    pub fn uri(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}
