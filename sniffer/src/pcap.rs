use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_MICROS_SWAPPED: u32 = 0xd4c3_b2a1;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const MAGIC_NANOS_SWAPPED: u32 = 0x4d3c_b2a1;

const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

/// Captures are taken with an unlimited snap length, but tcpdump still caps
/// records at 256 KiB; anything larger means the stream is corrupt.
const MAX_RECORD_LEN: usize = 256 * 1024;

/// Link-layer framing announced in the pcap global header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback: 4-byte address-family prefix (macOS `lo0`).
    Null,
    /// 14-byte Ethernet header (Linux `lo` appears this way).
    Ethernet,
    Other(u32),
}

impl From<u32> for LinkType {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::Null,
            1 => Self::Ethernet,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Endianness {
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub ts_sec: u32,
    pub ts_frac: u32,
    pub data: Vec<u8>,
}

/// Incremental reader for the classic pcap stream format: a 24-byte global
/// header whose magic determines endianness, then 16-byte record headers
/// followed by packet bytes.
#[derive(Debug)]
pub struct PcapReader<R> {
    reader: R,
    endian: Endianness,
    link_type: LinkType,
}

impl<R: AsyncRead + Unpin> PcapReader<R> {
    pub async fn new(mut reader: R) -> Result<Self> {
        let mut header = [0u8; GLOBAL_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .await
            .context("failed to read pcap global header")?;

        let raw_magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let endian = match raw_magic {
            MAGIC_MICROS | MAGIC_NANOS => Endianness::Little,
            MAGIC_MICROS_SWAPPED | MAGIC_NANOS_SWAPPED => Endianness::Big,
            other => bail!("unknown pcap magic: {other:#010x}"),
        };
        let link_type = LinkType::from(u32_at(&header, 20, endian));

        Ok(Self {
            reader,
            endian,
            link_type,
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Next packet record, or `None` once the stream ends.
    pub async fn next_packet(&mut self) -> Result<Option<CapturedPacket>> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("failed to read pcap record header"),
        }

        let ts_sec = u32_at(&header, 0, self.endian);
        let ts_frac = u32_at(&header, 4, self.endian);
        let incl_len = u32_at(&header, 8, self.endian) as usize;
        if incl_len > MAX_RECORD_LEN {
            bail!("oversized pcap record ({incl_len} bytes)");
        }

        let mut data = vec![0u8; incl_len];
        match self.reader.read_exact(&mut data).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("failed to read pcap record"),
        }

        Ok(Some(CapturedPacket {
            ts_sec,
            ts_frac,
            data,
        }))
    }
}

fn u32_at(bytes: &[u8], offset: usize, endian: Endianness) -> u32 {
    let raw = [
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ];
    match endian {
        Endianness::Little => u32::from_le_bytes(raw),
        Endianness::Big => u32::from_be_bytes(raw),
    }
}
