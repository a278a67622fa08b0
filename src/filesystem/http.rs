use crate::{
    errors::VFSError,
    filesystem::{Driver, VPath},
    protocol::WriteMode,
    stream::{self, ByteReader, ByteWriter, EntryStream, DEFAULT_HIGH_WATER_MARK},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{header, Client, ClientBuilder, StatusCode};
use std::time::Duration;
use url::Url;

/// Read-mostly driver backed by an HTTP server
///
/// Reads are GET requests, access checks are HEAD requests and deletes are
/// DELETE requests, all relative to a base URL. Listing and writing are
/// always denied.
pub struct HttpFS {
    base: Url,
    client: Client,
    high_water_mark: usize,
}

/// Builder for configuring custom [HttpFS] instances
pub struct HttpFSBuilder {
    base: Url,
    network: ClientBuilder,
    high_water_mark: usize,
}

impl HttpFSBuilder {
    /// Start configuring a driver rooted at `base`
    pub fn new(base: Url) -> Self {
        HttpFSBuilder {
            base,
            network: Client::builder().user_agent(HttpFS::default_user_agent()),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Set a timeout for each network request
    ///
    /// This timeout applies from the beginning of a request until the last
    /// byte has been received. By default there is no timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.timeout(timeout);
        self
    }

    /// Set a timeout for only the initial connect phase of each network request
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.connect_timeout(timeout);
        self
    }

    /// Sets the `User-Agent` header used by this driver
    pub fn user_agent(mut self, agent: &str) -> Self {
        self.network = self.network.user_agent(agent);
        self
    }

    /// Buffering limit for response body streams
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    /// Construct a driver using the settings in this builder
    pub fn build(self) -> Result<HttpFS, VFSError> {
        let mut base = self.base;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.set_query(None);
        base.set_fragment(None);
        Ok(HttpFS {
            base,
            client: self
                .network
                .build()
                .map_err(|err| VFSError::Transport(err.to_string()))?,
            high_water_mark: self.high_water_mark,
        })
    }
}

fn transport(err: reqwest::Error) -> VFSError {
    VFSError::Transport(err.to_string())
}

impl HttpFS {
    pub fn builder(base: Url) -> HttpFSBuilder {
        HttpFSBuilder::new(base)
    }

    /// Driver with default settings rooted at `base`
    pub fn new(base: Url) -> Result<Self, VFSError> {
        HttpFS::builder(base).build()
    }

    /// Default user agent string
    pub fn default_user_agent() -> String {
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    fn url(&self, path: &VPath) -> Result<Url, VFSError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| VFSError::Transport(format!("{} can't be a base URL", self.base)))?
            .pop_if_empty()
            .extend(path.segments());
        Ok(url)
    }
}

#[async_trait]
impl Driver for HttpFS {
    async fn resolve_uri(&self, path: &VPath) -> Result<String, VFSError> {
        Ok(self.url(path)?.to_string())
    }

    async fn access(&self, path: &VPath) -> Result<bool, VFSError> {
        let response = self
            .client
            .head(self.url(path)?)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            other => Err(VFSError::Http(other.as_u16())),
        }
    }

    async fn read_dir(&self, _path: &VPath) -> Result<EntryStream, VFSError> {
        Err(VFSError::AccessDenied)
    }

    async fn read_file(
        &self,
        path: &VPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader, VFSError> {
        if path.is_root() {
            return Err(VFSError::IsADirectory);
        }
        if length == Some(0) {
            return Ok(ByteReader::empty());
        }
        let mut request = self.client.get(self.url(path)?);
        if offset > 0 || length.is_some() {
            // past u64::MAX the range is open-ended; the length still caps the read
            let range = match length.and_then(|length| offset.checked_add(length)) {
                Some(end) => format!("bytes={}-{}", offset, end - 1),
                None => format!("bytes={}-", offset),
            };
            request = request.header(header::RANGE, range);
        }
        let response = request.send().await.map_err(transport)?;
        // a server that ignores the range sends everything from the start
        let mut skip = match response.status() {
            StatusCode::OK => offset,
            StatusCode::PARTIAL_CONTENT => 0,
            StatusCode::NOT_FOUND => return Err(VFSError::NotFound),
            StatusCode::FORBIDDEN => return Err(VFSError::AccessDenied),
            other => return Err(VFSError::Http(other.as_u16())),
        };
        let mut remaining = length.unwrap_or(u64::MAX);
        let (mut writer, reader) = stream::pipe(self.high_water_mark);
        let mut body = Box::pin(response.bytes_stream());
        tokio::spawn(async move {
            while remaining > 0 {
                let mut chunk: Bytes = match body.next().await {
                    None => break,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) => {
                        writer.abort(err.to_string());
                        return;
                    }
                };
                if skip > 0 {
                    let dropped = skip.min(chunk.len() as u64);
                    skip -= dropped;
                    chunk = chunk.slice(dropped as usize..);
                }
                if chunk.len() as u64 > remaining {
                    chunk.truncate(remaining as usize);
                }
                remaining -= chunk.len() as u64;
                if let Err(err) = writer.write(chunk).await {
                    log::trace!("http read abandoned, {}", err);
                    return;
                }
            }
        });
        Ok(reader)
    }

    async fn write_file(
        &self,
        _path: &VPath,
        _mode: WriteMode,
        _create: bool,
    ) -> Result<ByteWriter, VFSError> {
        Err(VFSError::AccessDenied)
    }

    async fn delete_node(&self, path: &VPath, _recursive: bool) -> Result<(), VFSError> {
        if path.is_root() {
            return Err(VFSError::Busy);
        }
        let response = self
            .client
            .delete(self.url(path)?)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else if status == StatusCode::FORBIDDEN
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::METHOD_NOT_ALLOWED
        {
            Err(VFSError::AccessDenied)
        } else {
            Err(VFSError::Http(status.as_u16()))
        }
    }
}
