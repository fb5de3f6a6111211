use postrider_common::{error::SessionError, internal, outgoing, status::Status};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Event, Session};
use crate::State;

/// Bytes a buffered-but-incomplete end-of-data marker can occupy at the
/// tail of the message buffer. Those bytes never count towards the body,
/// so the mid-stream size check leaves room for them; the exact check
/// happens once the marker arrives and is stripped.
const DATA_TERMINATOR_SLACK: usize = 3;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Receive and process data from the client.
    ///
    /// # Errors
    /// Returns `SessionError` on protocol errors or I/O failure.
    pub(super) async fn receive(&mut self) -> Result<Event, SessionError> {
        let mut received_data = [0; 4096];

        match self.connection.receive(&mut received_data).await {
            // Any error received here is fatal for the session
            Err(err) => {
                internal!("Error: {err}");
                Err(SessionError::Protocol(err.to_string()))
            }
            // Reading 0 bytes means the other side has closed the
            // connection or is done writing, then so are we.
            Ok(0) => Ok(Event::ConnectionClose),
            Ok(bytes_read) => self.ingest(&received_data[..bytes_read]).await,
        }
    }

    /// Feed received bytes through line assembly or data reception,
    /// depending on state, writing any replies back to the peer.
    pub(super) async fn ingest(&mut self, received: &[u8]) -> Result<Event, SessionError> {
        if matches!(self.state, State::Reading(_)) {
            return self.handle_data_reception(received).await;
        }

        self.line.extend_from_slice(received);

        while let Some(pos) = self.line.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.line.drain(..=pos).collect();
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }

            if line.len() > self.max_command_line {
                return self.reject_oversized_line().await;
            }

            let (replies, event) = self.handle_command(&line).await;
            for reply in &replies {
                self.send_reply(reply).await?;
            }

            match event {
                Event::ConnectionKeepAlive => {}
                other => return Ok(other),
            }

            // DATA moved us into message reception; anything the client
            // already pipelined belongs to the body
            if matches!(self.state, State::Reading(_)) {
                let rest = std::mem::take(&mut self.line);
                if rest.is_empty() {
                    return Ok(Event::ConnectionKeepAlive);
                }
                return self.handle_data_reception(&rest).await;
            }
        }

        // No terminator yet; an overlong unterminated line is rejected
        // without waiting for the rest of it
        if self.line.len() > self.max_command_line {
            return self.reject_oversized_line().await;
        }

        Ok(Event::ConnectionKeepAlive)
    }

    /// Accumulate message data, enforcing the size cap on the body with the
    /// end-of-data marker stripped, and complete the transaction once the
    /// marker arrives. A body of exactly the cap is accepted; one byte over
    /// is refused mid-stream.
    async fn handle_data_reception(&mut self, received: &[u8]) -> Result<Event, SessionError> {
        self.message.extend(received);

        if let Some(len) = self.data_end() {
            self.message.truncate(len);

            if self.exceeds_size_cap(self.message.len()) {
                return self.reject_oversized_message(self.message.len()).await;
            }

            let (replies, event) = self.finish_message().await;
            for reply in &replies {
                self.send_reply(reply).await?;
            }
            return Ok(event);
        }

        let pending = self.message.len().saturating_sub(DATA_TERMINATOR_SLACK);
        if self.exceeds_size_cap(pending) {
            return self.reject_oversized_message(pending).await;
        }

        Ok(Event::ConnectionKeepAlive)
    }

    const fn exceeds_size_cap(&self, len: usize) -> bool {
        self.max_message_size > 0 && len > self.max_message_size
    }

    async fn reject_oversized_message(&mut self, size: usize) -> Result<Event, SessionError> {
        let reply = format!(
            "{} Message size {size} bytes exceeds maximum allowed size {} bytes",
            Status::ExceededStorage,
            self.max_message_size
        );
        self.send_reply(&reply).await?;
        Ok(Event::ConnectionClose)
    }

    /// Length of the message with the end-of-data marker stripped, if the
    /// marker has arrived. The final line terminator stays on the message.
    fn data_end(&self) -> Option<usize> {
        let message = &self.message;

        if message.ends_with(b"\r\n.\r\n") {
            return Some(message.len() - 3);
        }
        if message == b".\r\n" {
            return Some(0);
        }

        if self.crlf_relaxed {
            if message.ends_with(b"\n.\n") {
                return Some(message.len() - 2);
            }
            if message == b".\n" {
                return Some(0);
            }
        }

        None
    }

    async fn reject_oversized_line(&mut self) -> Result<Event, SessionError> {
        let reply = format!(
            "{} Command line longer than {} bytes",
            Status::SyntaxError,
            self.max_command_line
        );
        self.send_reply(&reply).await?;
        Ok(Event::ConnectionClose)
    }

    pub(super) async fn send_reply(&mut self, reply: &str) -> Result<(), SessionError> {
        outgoing!("{reply}");

        self.connection.send(&reply).await.map_err(|err| {
            internal!(level = ERROR, "{err}");
            SessionError::Protocol(format!("Failed to send response: {err}"))
        })?;

        Ok(())
    }
}
