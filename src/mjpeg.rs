//! MJPEG over HTTP
//!
//! Opens a plain HTTP/1.1 GET against the camera, validates the multipart
//! response and pumps the body through a [`MultipartSplitter`]. Complete
//! payloads go through an [`ImageDecoder`]; payloads that fail to decode
//! are dropped and the stream carries on.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use image::{DynamicImage, ImageFormat};
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::error::{Result, RobotError};
use crate::frame::MultipartSplitter;

/// Bound on TCP connect to the camera
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns one complete payload into an image
pub trait ImageDecoder: Send + Sync {
    /// `None` when the payload is not a decodable image
    fn decode(&self, payload: &[u8]) -> Option<DynamicImage>;
}

/// Decodes payloads as standalone JPEG images
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegDecoder;

impl ImageDecoder for JpegDecoder {
    fn decode(&self, payload: &[u8]) -> Option<DynamicImage> {
        match image::load_from_memory_with_format(payload, ImageFormat::Jpeg) {
            Ok(image) => Some(image),
            Err(e) => {
                debug!("JPEG decode failed: {}", e);
                None
            }
        }
    }
}

/// HTTP client for MJPEG camera streams
#[derive(Clone)]
pub struct MjpegClient {
    decoder: Arc<dyn ImageDecoder>,
    connect_timeout: Duration,
}

impl MjpegClient {
    pub fn new() -> Self {
        Self::with_decoder(Arc::new(JpegDecoder))
    }

    /// Use a custom payload decoder
    pub fn with_decoder(decoder: Arc<dyn ImageDecoder>) -> Self {
        Self {
            decoder,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Open the stream at `url` and validate the multipart response
    pub async fn connect(&self, url: &str) -> Result<MjpegStream> {
        let uri: Uri = url
            .parse()
            .map_err(|e| RobotError::InvalidUrl(format!("{}: {}", url, e)))?;
        if uri.scheme_str() != Some("http") {
            return Err(RobotError::InvalidUrl(format!("{}: expected http://", url)));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| RobotError::InvalidUrl(format!("{}: missing host", url)))?
            .clone();
        let host = authority.host().trim_start_matches('[').trim_end_matches(']').to_string();
        let port = authority.port_u16().unwrap_or(80);
        let path = uri.path_and_query().map_or("/", |p| p.as_str()).to_string();

        debug!("Connecting to camera {}:{}", host, port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| RobotError::Timeout(self.connect_timeout))??;
        tcp.set_nodelay(true)?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tcp)).await?;
        let connection = ConnectionTask(tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Camera connection ended: {}", e);
            }
        }));

        let request = Request::builder()
            .uri(path)
            .header(header::HOST, authority.as_str())
            .header(header::ACCEPT, "multipart/x-mixed-replace, */*")
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(request).await?;

        if !response.status().is_success() {
            return Err(RobotError::Protocol(format!("Failed to connect: {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .ok_or_else(|| RobotError::Protocol("Missing Content-Type header".into()))?
            .to_str()
            .map_err(|_| RobotError::Protocol("Unreadable Content-Type header".into()))?;
        let splitter = MultipartSplitter::from_content_type(content_type).ok_or_else(|| {
            RobotError::Protocol(format!("Missing boundary in Content-Type: {}", content_type))
        })?;

        info!("📹 Stream opened: {}", url);
        debug!("Part boundary: {}", String::from_utf8_lossy(splitter.boundary()));

        Ok(MjpegStream {
            body: response.into_body(),
            splitter,
            decoder: Arc::clone(&self.decoder),
            decoded: 0,
            skipped: 0,
            _sender: sender,
            _connection: connection,
        })
    }
}

impl Default for MjpegClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Aborts the HTTP connection driver when the stream goes away
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A live MJPEG stream.
///
/// Frames are pulled in order with [`MjpegStream::next_frame`]. Dropping the
/// stream closes the socket, whichever way the consumer stopped.
pub struct MjpegStream {
    body: Incoming,
    splitter: MultipartSplitter,
    decoder: Arc<dyn ImageDecoder>,
    decoded: u64,
    skipped: u64,
    _sender: SendRequest<Empty<Bytes>>,
    _connection: ConnectionTask,
}

impl MjpegStream {
    /// Next decoded frame, `Ok(None)` once the camera ends the stream
    pub async fn next_frame(&mut self) -> Result<Option<DynamicImage>> {
        loop {
            while let Some(payload) = self.splitter.next_payload() {
                match self.decoder.decode(&payload) {
                    Some(image) => {
                        self.decoded += 1;
                        return Ok(Some(image));
                    }
                    None => {
                        self.skipped += 1;
                        debug!("Skipped undecodable frame ({} bytes)", payload.len());
                    }
                }
            }

            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.splitter.push(&data);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    /// Frames decoded so far
    pub fn frames_decoded(&self) -> u64 {
        self.decoded
    }

    /// Payloads dropped because they did not decode
    pub fn frames_skipped(&self) -> u64 {
        self.skipped
    }
}
