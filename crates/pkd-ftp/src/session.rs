//! `ProtocolSession` for FTP and FTPS.
//!
//! Resume in both directions relies on `REST STREAM`; servers that do not
//! advertise it get neither capability and transfers restart from zero.

use crate::client::FtpClient;
use crate::transfer::DataStream;
use async_trait::async_trait;
use pkd_core::{
    AuthMaterial, Capabilities, ChunkReader, ChunkWriter, ConnectContext, Endpoint, Entry,
    ProtocolSession, TransferError, TransferResult,
};

pub struct FtpSession {
    client: FtpClient,
    endpoint: Endpoint,
    caps: Capabilities,
    /// Set while a data transfer is open; a reader/writer dropped without
    /// `finish` leaves the control channel out of sync.
    transfer_in_flight: bool,
}

impl FtpSession {
    pub async fn connect(
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Self> {
        let client = FtpClient::connect(endpoint, auth, ctx.timeout).await?;
        let mut caps = Capabilities::empty();
        if client.features.rest_stream {
            caps.insert(Capabilities::RESUME_READ | Capabilities::RESUME_WRITE);
        }
        log::info!(
            "FTP session ready on {} ({:?}, MLSD: {})",
            endpoint.key(),
            caps,
            client.features.mlsd
        );
        Ok(Self {
            client,
            endpoint: endpoint.clone(),
            caps,
            transfer_in_flight: false,
        })
    }

    fn ensure_idle(&self) -> TransferResult<()> {
        if self.transfer_in_flight {
            return Err(TransferError::connection_reset(
                "control connection busy with an abandoned transfer",
            ));
        }
        if !self.client.is_connected() {
            return Err(TransferError::connection_reset("session is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolSession for FtpSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn list(&mut self, path: &str) -> TransferResult<Vec<Entry>> {
        self.ensure_idle()?;
        self.client.list(path).await
    }

    async fn stat(&mut self, path: &str) -> TransferResult<Entry> {
        self.ensure_idle()?;
        self.client.stat(path).await
    }

    async fn open_read<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
    ) -> TransferResult<Box<dyn ChunkReader + 'a>> {
        self.ensure_idle()?;
        if offset > 0 && !self.caps.contains(Capabilities::RESUME_READ) {
            return Err(TransferError::unsupported(
                "server does not support REST STREAM",
            ));
        }
        let data = self
            .client
            .open_transfer(&format!("RETR {}", path), offset)
            .await?;
        self.transfer_in_flight = true;
        log::debug!("RETR {} from offset {}", path, offset);
        Ok(Box::new(FtpReader {
            session: self,
            data: Some(data),
        }))
    }

    async fn open_write<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter + 'a>> {
        self.ensure_idle()?;
        let offset = if truncate { 0 } else { offset };
        if offset > 0 && !self.caps.contains(Capabilities::RESUME_WRITE) {
            return Err(TransferError::unsupported(
                "server does not support restarting uploads",
            ));
        }
        let data = self
            .client
            .open_transfer(&format!("STOR {}", path), offset)
            .await?;
        self.transfer_in_flight = true;
        log::debug!("STOR {} from offset {}", path, offset);
        Ok(Box::new(FtpWriter {
            session: self,
            data: Some(data),
        }))
    }

    async fn mkdir(&mut self, path: &str) -> TransferResult<()> {
        self.ensure_idle()?;
        self.client.codec.expect_ok(&format!("MKD {}", path)).await?;
        Ok(())
    }

    async fn remove(&mut self, path: &str) -> TransferResult<()> {
        self.ensure_idle()?;
        match self.client.codec.expect_ok(&format!("DELE {}", path)).await {
            Ok(_) => Ok(()),
            Err(dele_err) => match self.client.codec.expect_ok(&format!("RMD {}", path)).await {
                Ok(_) => Ok(()),
                Err(_) => Err(dele_err),
            },
        }
    }

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()> {
        self.ensure_idle()?;
        self.client.codec.expect(&format!("RNFR {}", from), 3).await?;
        self.client.codec.expect_ok(&format!("RNTO {}", to)).await?;
        Ok(())
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> TransferResult<()> {
        self.ensure_idle()?;
        let reply = self
            .client
            .codec
            .execute(&format!("SITE CHMOD {:o} {}", mode & 0o7777, path))
            .await?;
        if reply.is_completion() {
            return Ok(());
        }
        let err = reply.into_error();
        if matches!(err.code, Some(500) | Some(502) | Some(504)) {
            return Err(TransferError::unsupported(format!(
                "SITE CHMOD not supported: {}",
                err.message
            )));
        }
        Err(err)
    }

    async fn close(&mut self) -> TransferResult<()> {
        if !self.transfer_in_flight {
            self.client.quit().await?;
        }
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        !self.transfer_in_flight && self.client.is_connected()
    }

    async fn keepalive(&mut self) -> TransferResult<()> {
        self.ensure_idle()?;
        self.client.noop().await
    }
}

// ─── Data-channel reader / writer ────────────────────────────────────

struct FtpReader<'a> {
    session: &'a mut FtpSession,
    data: Option<DataStream>,
}

#[async_trait]
impl<'a> ChunkReader for FtpReader<'a> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        let limit = self.session.client.io_timeout();
        match self.data.as_mut() {
            Some(data) => data.read(buf, limit).await,
            None => Ok(0),
        }
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        // Closing our end first lets the server send 226.
        self.data.take();
        self.session.client.finish_transfer().await?;
        self.session.transfer_in_flight = false;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> TransferResult<()> {
        self.data.take();
        let reply = self.session.client.codec.drain_transfer_reply().await?;
        log::debug!("download abandoned: {} {}", reply.code, reply.message());
        self.session.transfer_in_flight = false;
        Ok(())
    }
}

struct FtpWriter<'a> {
    session: &'a mut FtpSession,
    data: Option<DataStream>,
}

#[async_trait]
impl<'a> ChunkWriter for FtpWriter<'a> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> TransferResult<()> {
        let limit = self.session.client.io_timeout();
        match self.data.as_mut() {
            Some(data) => data.write_all(chunk, limit).await,
            None => Err(TransferError::protocol("write after finish")),
        }
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        if let Some(mut data) = self.data.take() {
            data.shutdown().await?;
        }
        self.session.client.finish_transfer().await?;
        self.session.transfer_in_flight = false;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> TransferResult<()> {
        if let Some(mut data) = self.data.take() {
            if let Err(e) = data.shutdown().await {
                log::debug!("data channel shutdown on abort: {}", e);
            }
        }
        let reply = self.session.client.codec.drain_transfer_reply().await?;
        log::debug!("upload abandoned: {} {}", reply.code, reply.message());
        self.session.transfer_in_flight = false;
        Ok(())
    }
}
