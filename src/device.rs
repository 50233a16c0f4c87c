//! Device RPC session
//!
//! Talks to the network device over its XML management protocol: framed
//! request/reply over TCP, each message terminated by the `]]>]]>` delimiter,
//! with a hello exchange on connect.
//!
//! Session flow:
//! 1. Connect (TCP_NODELAY + keepalive on the socket)
//! 2. Read server hello, send client hello
//! 3. Per query: send `<rpc>...</rpc>`, read one framed reply
//!
//! This module is the only place that knows about the device protocol. It
//! hands the rest of the program plain values (`PoolMeta`, `ClusterMode`,
//! `PoolSnapshot`) - the aggregation core never sees XML.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::snapshot::{ClusterMode, PoolMeta, PoolSnapshot};

/// Frame delimiter of the management protocol
const FRAME_END: &str = "]]>]]>";

const CLIENT_HELLO: &str = "<hello><capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities></hello>";

/// One RPC session to a device.
pub struct Device {
    stream: TcpStream,
    buf: Vec<u8>,
    timeout: Duration,
}

impl Device {
    /// Connect and perform the hello exchange.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|_| anyhow!("Invalid device address: {}", addr))?;

        let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        socket.set_nonblocking(true)?;

        // Start async connect; completion is signaled by writability
        let _ = socket.connect(&SockAddr::from(sock_addr));

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;
        stream.writable().await?;
        if let Err(e) = stream.peer_addr() {
            return Err(anyhow!("Failed to connect to device {}: {}", addr, e));
        }

        info!("Connected to device {}", addr);

        let mut device = Self {
            stream,
            buf: Vec::new(),
            timeout,
        };

        let hello = device.read_frame().await?;
        if !hello.contains("<hello") {
            bail!("unexpected greeting from device: {}", hello.trim());
        }
        debug!("Device hello: {}", hello.trim());
        device
            .write_frame(CLIENT_HELLO)
            .await
            .map_err(|e| anyhow!("hello exchange failed: {}", e))?;

        Ok(device)
    }

    /// Send one RPC and return the reply document.
    pub async fn rpc(&mut self, body: &str) -> Result<String> {
        debug!("RPC: {}", body);
        self.write_frame(&format!("<rpc>{}</rpc>", body)).await?;
        let reply = self.read_frame().await?;

        if let Some(err) = xml::find_first(&reply, "error-message") {
            bail!("device returned RPC error: {}", err);
        }
        Ok(reply)
    }

    async fn write_frame(&mut self, payload: &str) -> Result<()> {
        self.stream.write_all(payload.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.write_all(FRAME_END.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read until the frame delimiter, with the session timeout applied to
    /// every read.
    async fn read_frame(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = find_subslice(&self.buf, FRAME_END.as_bytes()) {
                let frame = self.buf.drain(..pos + FRAME_END.len()).collect::<Vec<u8>>();
                let frame = String::from_utf8(frame)
                    .map_err(|_| anyhow!("device sent non-UTF-8 reply"))?;
                return Ok(frame.trim_end_matches(FRAME_END).to_string());
            }

            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(self.timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| anyhow!("Timeout waiting for device reply"))??;
            if n == 0 {
                bail!("device closed connection mid-reply");
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// All PBA-enabled NAT pools on the device, keyed by pool name.
    ///
    /// Pools without block-allocation config (no `source-pool-blk-total`) are
    /// plain NAT pools and are skipped.
    pub async fn list_pba_pools(&mut self) -> Result<BTreeMap<String, PoolMeta>> {
        let reply = self
            .rpc("<retrieve-source-nat-pool-information><all/></retrieve-source-nat-pool-information>")
            .await?;

        let mut pools = BTreeMap::new();
        for entry in xml::find_all(&reply, "source-nat-pool-info-entry") {
            if xml::find_first(entry, "source-pool-blk-total").is_none() {
                continue;
            }
            let name = xml::find_first(entry, "pool-name")
                .ok_or_else(|| anyhow!("malformed pool entry: missing pool-name"))?;
            let meta = PoolMeta {
                block_size: int_field(entry, "source-pool-blk-size")?,
                max_blocks_per_host: int_field(entry, "source-pool-blk-max-per-host")?,
                blocks_total: int_field(entry, "source-pool-blk-total")?,
                blocks_used: int_field(entry, "source-pool-blk-used")?,
            };
            pools.insert(name.to_string(), meta);
        }
        Ok(pools)
    }

    /// Detect chassis redundancy mode. A/P is the explicit `active-backup`
    /// redundancy mode; any other operational state of a cluster counts as A/A.
    pub async fn cluster_mode(&mut self) -> Result<ClusterMode> {
        let status = self.rpc("<get-chassis-cluster-status/>").await?;
        if xml::find_first(&status, "cluster-id").is_none() {
            return Ok(ClusterMode::Standalone);
        }

        let detail = self
            .rpc("<get-chassis-cluster-detail-information/>")
            .await?;
        match xml::find_first(&detail, "operational") {
            Some("active-active") => Ok(ClusterMode::ActiveActive),
            Some(_) => Ok(ClusterMode::ActivePassive),
            None => bail!("clustered device did not report an operational mode"),
        }
    }

    /// Fetch the allocated port blocks of one pool and build the snapshot.
    ///
    /// On a cluster the query is scoped to one node - querying both would
    /// double count every block.
    pub async fn fetch_snapshot(
        &mut self,
        pool_name: &str,
        meta: PoolMeta,
        cluster_mode: ClusterMode,
        node: Option<&str>,
    ) -> Result<PoolSnapshot> {
        let body = match node {
            Some(node) => format!(
                "<get-src-nat-port-block><pool>{}</pool><node>{}</node></get-src-nat-port-block>",
                pool_name, node
            ),
            None => format!(
                "<get-src-nat-port-block><pool>{}</pool></get-src-nat-port-block>",
                pool_name
            ),
        };
        let reply = self.rpc(&body).await?;

        let internal_ips = xml::find_all(&reply, "blk-internal-ip");
        let reflexive_ips = xml::find_all(&reply, "blk-reflexive-ip");
        let ports_used = xml::find_all(&reply, "blk-ports-used");
        debug!(
            "Fetched {} block records for pool {}",
            internal_ips.len(),
            pool_name
        );

        PoolSnapshot::from_columns(
            pool_name,
            meta,
            cluster_mode,
            &internal_ips,
            &reflexive_ips,
            &ports_used,
        )
    }
}

fn int_field(doc: &str, tag: &str) -> Result<u64> {
    let text = xml::find_first(doc, tag)
        .ok_or_else(|| anyhow!("malformed pool entry: missing {}", tag))?;
    text.parse()
        .map_err(|_| anyhow!("malformed pool entry: bad {} value {:?}", tag, text))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Minimal XML field extraction - just enough for the flat reply documents
/// the device sends (no nesting of a tag inside itself, no entities).
pub mod xml {
    /// Trimmed inner text of every `<tag>...</tag>` occurrence, in document
    /// order. Self-closing occurrences are skipped.
    pub fn find_all<'a>(doc: &'a str, tag: &str) -> Vec<&'a str> {
        let open = format!("<{}", tag);
        let close = format!("</{}>", tag);
        let mut out = Vec::new();
        let mut rest = doc;

        while let Some(start) = rest.find(&open) {
            let after = &rest[start + open.len()..];
            let Some(gt) = after.find('>') else { break };
            let head = &after[..gt];

            // exact tag match only: "<pool-name" must not hit "<pool-names>"
            let tag_matches =
                head.is_empty() || head == "/" || head.starts_with(|c: char| c.is_whitespace());
            if !tag_matches {
                rest = after;
                continue;
            }
            if head.ends_with('/') {
                rest = &after[gt + 1..];
                continue;
            }

            let body = &after[gt + 1..];
            let Some(end) = body.find(&close) else { break };
            out.push(body[..end].trim());
            rest = &body[end + close.len()..];
        }
        out
    }

    /// First `<tag>` text, if any.
    pub fn find_first<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
        find_all(doc, tag).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_xml_find_all_basic() {
        let doc = "<a><ip>10.0.0.1</ip><ip> 10.0.0.2 </ip></a>";
        assert_eq!(xml::find_all(doc, "ip"), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(xml::find_first(doc, "ip"), Some("10.0.0.1"));
        assert_eq!(xml::find_first(doc, "missing"), None);
    }

    #[test]
    fn test_xml_attributes_and_self_closing() {
        let doc = r#"<pool style="brief">p1</pool><pool/><pool >p2</pool>"#;
        assert_eq!(xml::find_all(doc, "pool"), vec!["p1", "p2"]);
    }

    #[test]
    fn test_xml_tag_prefix_does_not_match() {
        let doc = "<pool-names>bogus</pool-names><pool-name>real</pool-name>";
        assert_eq!(xml::find_all(doc, "pool-name"), vec!["real"]);
    }

    #[test]
    fn test_xml_entry_bodies_keep_nested_tags() {
        let doc = "<entry><x>1</x></entry><entry><x>2</x></entry>";
        let entries = xml::find_all(doc, "entry");
        assert_eq!(entries.len(), 2);
        assert_eq!(xml::find_first(entries[1], "x"), Some("2"));
    }

    const POOL_INFO_REPLY: &str = "<rpc-reply>\
        <source-nat-pool-info-entry>\
          <pool-name>plain-pool</pool-name>\
        </source-nat-pool-info-entry>\
        <source-nat-pool-info-entry>\
          <pool-name>pba-pool</pool-name>\
          <source-pool-blk-size>128</source-pool-blk-size>\
          <source-pool-blk-max-per-host>8</source-pool-blk-max-per-host>\
          <source-pool-blk-total>1000</source-pool-blk-total>\
          <source-pool-blk-used>3</source-pool-blk-used>\
        </source-nat-pool-info-entry>\
        </rpc-reply>";

    /// Loopback server that speaks just enough of the protocol for one
    /// session: hello exchange, then canned replies in order.
    async fn spawn_device(replies: Vec<&'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"<hello><capabilities/></hello>\n]]>]]>\n")
                .await
                .unwrap();

            let mut buf = Vec::new();
            let mut frames_seen = 0usize;
            let mut replies = replies.into_iter();
            let mut chunk = [0u8; 4096];
            loop {
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = find_subslice(&buf, FRAME_END.as_bytes()) {
                    buf.drain(..pos + FRAME_END.len());
                    frames_seen += 1;
                    // first frame is the client hello, the rest are RPCs
                    if frames_seen > 1 {
                        let Some(reply) = replies.next() else { return };
                        stream.write_all(reply.as_bytes()).await.unwrap();
                        stream.write_all(b"\n]]>]]>\n").await.unwrap();
                    }
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_session_lists_pba_pools() {
        let addr = spawn_device(vec![POOL_INFO_REPLY]).await;
        let mut device = Device::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        let pools = device.list_pba_pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        let meta = pools["pba-pool"];
        assert_eq!(meta.block_size, 128);
        assert_eq!(meta.max_blocks_per_host, 8);
        assert_eq!(meta.blocks_total, 1000);
        assert_eq!(meta.blocks_used, 3);
    }

    #[tokio::test]
    async fn test_session_fetches_snapshot() {
        let reply = "<rpc-reply>\
            <blk-internal-ip>10.0.0.1</blk-internal-ip>\
            <blk-reflexive-ip>203.0.113.1</blk-reflexive-ip>\
            <blk-ports-used>100</blk-ports-used>\
            <blk-internal-ip>10.0.0.2</blk-internal-ip>\
            <blk-reflexive-ip>203.0.113.2</blk-reflexive-ip>\
            <blk-ports-used>200</blk-ports-used>\
            </rpc-reply>";
        let addr = spawn_device(vec![reply]).await;
        let mut device = Device::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        let meta = PoolMeta {
            block_size: 128,
            max_blocks_per_host: 8,
            blocks_total: 1000,
            blocks_used: 2,
        };
        let snap = device
            .fetch_snapshot("pba-pool", meta, ClusterMode::Standalone, None)
            .await
            .unwrap();
        assert_eq!(snap.records.len(), 2);
        assert_eq!(snap.records[1].ports_used, 200);
    }

    #[tokio::test]
    async fn test_session_detects_standalone() {
        let addr = spawn_device(vec!["<rpc-reply></rpc-reply>"]).await;
        let mut device = Device::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(device.cluster_mode().await.unwrap(), ClusterMode::Standalone);
    }

    #[tokio::test]
    async fn test_session_detects_active_active() {
        let addr = spawn_device(vec![
            "<rpc-reply><cluster-id>1</cluster-id></rpc-reply>",
            "<rpc-reply><operational>active-active</operational></rpc-reply>",
        ])
        .await;
        let mut device = Device::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            device.cluster_mode().await.unwrap(),
            ClusterMode::ActiveActive
        );
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces() {
        let addr = spawn_device(vec![
            "<rpc-reply><rpc-error><error-message>bad pool</error-message></rpc-error></rpc-reply>",
        ])
        .await;
        let mut device = Device::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        let err = device.list_pba_pools().await.unwrap_err();
        assert!(err.to_string().contains("bad pool"));
    }
}
