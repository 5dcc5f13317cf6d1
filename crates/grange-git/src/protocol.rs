//! Git pkt-line framing
//!
//! Git uses "pkt-line" framing: 4 hex digits length prefix followed by data.
//! Only the writing side lives here; the `git` subprocess parses whatever
//! clients send.

/// Flush packet (marks end of message)
pub const FLUSH_PKT: &[u8] = b"0000";

/// The two smart HTTP services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    /// True for fetch/clone, false for push
    pub fn is_upload(&self) -> bool {
        matches!(self, Service::UploadPack)
    }

    /// Content type of the first-phase (info/refs) response
    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type of the second-phase (pack) response
    pub fn result_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    /// The subcommand of the `git` binary driving this service
    pub(crate) fn subcommand(&self) -> &'static str {
        match self {
            Service::UploadPack => "upload-pack",
            Service::ReceivePack => "receive-pack",
        }
    }
}

/// Frame a single pkt-line
pub fn pkt_line(data: &[u8]) -> Vec<u8> {
    let len = data.len() + 4; // Include the 4-byte length prefix
    let mut pkt = format!("{:04x}", len).into_bytes();
    pkt.extend_from_slice(data);
    pkt
}

/// The smart HTTP service announcement: `# service=<name>` pkt-line
/// followed by a flush-pkt. Must precede the ref advertisement.
pub fn service_announcement(service: Service) -> Vec<u8> {
    let mut out = pkt_line(format!("# service={}\n", service.name()).as_bytes());
    out.extend_from_slice(FLUSH_PKT);
    out
}
