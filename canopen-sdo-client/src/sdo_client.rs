use std::time::Duration;

use snafu::Snafu;

use canopen_sdo_common::{
    messages::{SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId, CanMessage, NodeId,
};

/// Timeout while awaiting a response frame, per transaction
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);
/// Number of times a timed-out request, or a failed send, is retried before surfacing an error
const MAX_RETRIES: u8 = 1;
/// Delay before retrying a send that failed due to a transient transport error
const SEND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to receive other values
/// and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code:?}"),
            RawAbortCode::Unknown(code) => write!(f, "{code:X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

/// Error returned by [`SdoClient`] methods
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// Timeout while awaiting an expected response
    NoResponse,
    /// Received a response that could not be interpreted
    MalformedResponse,
    /// Received a valid SdoResponse, but with an unexpected command specifier
    #[snafu(display("Unexpected SDO response. Expected {expecting}, got {response:?}"))]
    UnexpectedResponse {
        /// The type of response which was expected
        expecting: String,
        /// The response which was received
        response: SdoResponse,
    },
    /// Received a ServerAbort response from the node
    #[snafu(display("Received abort accessing object 0x{index:X}sub{sub}: {abort_code}"))]
    ServerAbort {
        /// Index of the SDO access which was aborted
        index: u16,
        /// Sub index of the SDO access which was aborted
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// Received a response with the wrong toggle bit
    ToggleNotAlternated,
    /// Received a response with a different index/sub value than was requested
    #[snafu(display("Received object 0x{:x}sub{} after requesting 0x{:x}sub{}",
        received.0, received.1, expected.0, expected.1))]
    MismatchedObjectIndex {
        /// The object ID which was expected to be echoed back
        expected: (u16, u8),
        /// The received object ID
        received: (u16, u8),
    },
    /// An SDO upload response had a size that did not match the expected size
    UnexpectedSize,
    /// Failed to write a message to the transport after retrying
    #[snafu(display("Error sending CAN message"))]
    SocketSendFailed,
    /// A block upload's computed CRC did not match the server-reported CRC
    CrcMismatch,
    /// A gap in block-upload sequence numbers could not be recovered by the retransmit protocol
    DataLoss,
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// Convenience macro for expecting a particular variant of a response and erroring on abort of
/// unexpected variant
macro_rules! match_response  {
    ($resp: ident, $expecting: literal, $($match:pat => $code : expr),*) => {
                match $resp {
                    $($match => $code),*
                    SdoResponse::Abort {
                        index,
                        sub,
                        abort_code,
                    } => {
                        return ServerAbortSnafu {
                            index,
                            sub,
                            abort_code,
                        }
                        .fail()
                    }
                    _ => {
                        return UnexpectedResponseSnafu {
                            expecting: $expecting,
                            response: $resp,
                        }
                        .fail()
                    }
                }
    };
}

/// Direction in which [`SdoClient::open`] accesses a sub-object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read the sub-object's current value
    Read,
    /// Write a new value to the sub-object
    Write,
}

/// A streaming handle returned by [`SdoClient::open`]
#[derive(Debug)]
pub enum SdoStream<'c, S, R> {
    /// A completed upload, exposed with `pos`/`size`/`read` semantics
    Reader(SdoReader),
    /// A pending write, buffered until [`SdoWriter::close`] performs the download
    Writer(SdoWriter<'c, S, R>),
}

/// An already-complete read of a sub-object's value
///
/// [`SdoClient::open`] runs the whole upload eagerly, so this just wraps the result with
/// `pos`/`size`/`read` accessors instead of handing back a bare `Vec<u8>`.
#[derive(Debug)]
pub struct SdoReader {
    data: Vec<u8>,
    pos: usize,
}

impl SdoReader {
    /// Current read offset
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Total size of the uploaded value
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copy up to `buf.len()` unread bytes into `buf`, returning the number copied
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Consume and return all remaining unread bytes
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let rest = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        rest
    }
}

/// A pending write to a sub-object, opened by [`SdoClient::open`]
///
/// Bytes are buffered locally; no frame is sent until [`Self::close`] is called.
#[derive(Debug)]
pub struct SdoWriter<'c, S, R> {
    client: &'c mut SdoClient<S, R>,
    index: u16,
    sub: u8,
    size: Option<usize>,
    block_transfer: bool,
    buf: Vec<u8>,
    closed: bool,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoWriter<'_, S, R> {
    /// Current buffered write offset
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Expected final size, if the caller supplied one to [`SdoClient::open`]
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Buffer bytes for the eventual write
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Flush the buffered bytes to the server, completing the write
    pub async fn close(mut self) -> Result<()> {
        if let Some(expected) = self.size {
            if self.buf.len() != expected {
                return UnexpectedSizeSnafu.fail();
            }
        }
        let result = if self.block_transfer {
            self.client
                .block_download(self.index, self.sub, &self.buf)
                .await
        } else {
            self.client.download(self.index, self.sub, &self.buf).await
        };
        self.closed = true;
        result
    }
}

impl<S, R> Drop for SdoWriter<'_, S, R> {
    fn drop(&mut self) {
        if !self.closed && !self.buf.is_empty() {
            log::warn!(
                "SdoWriter for 0x{:x}sub{} dropped with {} buffered bytes never written; call close() to perform the download",
                self.index,
                self.sub,
                self.buf.len()
            );
        }
    }
}

/// A client for accessing a node's SDO server
///
/// A single server can talk to a single client at a time; this client supports one transfer in
/// flight, serialized.
#[derive(Debug)]
pub struct SdoClient<S, R> {
    req_cob_id: CanId,
    resp_cob_id: CanId,
    sender: S,
    receiver: R,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoClient<S, R> {
    /// Create a new SdoClient talking to a node's default SDO server
    ///
    /// Nodes have a default SDO server, which uses a COB ID based on the node ID. It is possible
    /// for nodes to have other SDO servers on other COB IDs, and clients for these can be created
    /// using [`Self::with_cobids`].
    pub fn new(server_node_id: NodeId, sender: S, receiver: R) -> Self {
        let node_id = server_node_id.raw() as u16;
        let req_cob_id = CanId::Std(SDO_REQ_BASE + node_id);
        let resp_cob_id = CanId::Std(SDO_RESP_BASE + node_id);
        Self::with_cobids(req_cob_id, resp_cob_id, sender, receiver)
    }

    /// Create a new SdoClient from an explicit request/response COB ID pair
    pub fn with_cobids(req_cob_id: CanId, resp_cob_id: CanId, sender: S, receiver: R) -> Self {
        Self {
            req_cob_id,
            resp_cob_id,
            sender,
            receiver,
        }
    }

    /// Write data to a sub-object on the SDO server
    pub async fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.receiver.flush();

        if data.len() <= 4 {
            // Do an expedited transfer
            let msg =
                SdoRequest::expedited_download(index, sub, data).to_can_message(self.req_cob_id);
            let resp = self.request_response(msg).await?;
            match_response!(
                resp,
                "ConfirmDownload",
                SdoResponse::ConfirmDownload { index: _, sub: _ } => {
                    Ok(()) // Success!
                }
            )
        } else {
            let msg = SdoRequest::initiate_download(index, sub, Some(data.len() as u32))
                .to_can_message(self.req_cob_id);
            let resp = self.request_response(msg).await?;
            match_response!(
                resp,
                "ConfirmDownload",
                SdoResponse::ConfirmDownload { index: _, sub: _ } => { }
            );

            let mut toggle = false;
            let total_segments = data.len().div_ceil(7);
            for n in 0..total_segments {
                let last_segment = n == total_segments - 1;
                let segment_size = (data.len() - n * 7).min(7);
                let seg_msg = SdoRequest::download_segment(
                    toggle,
                    last_segment,
                    &data[n * 7..n * 7 + segment_size],
                )
                .to_can_message(self.req_cob_id);
                let resp = self.request_response(seg_msg).await?;
                match_response!(
                    resp,
                    "ConfirmDownloadSegment",
                    SdoResponse::ConfirmDownloadSegment { t } => {
                        if t != toggle {
                            let abort_msg =
                                SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated)
                                    .to_can_message(self.req_cob_id);
                            self.send(abort_msg).await?;
                            return ToggleNotAlternatedSnafu.fail();
                        }
                    }
                );
                toggle = !toggle;
            }
            Ok(())
        }
    }

    /// Read a sub-object on the SDO server
    pub async fn upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.receiver.flush();

        let mut read_buf = Vec::new();

        let msg = SdoRequest::initiate_upload(index, sub).to_can_message(self.req_cob_id);
        let resp = self.request_response(msg).await?;

        let expedited = match_response!(
            resp,
            "ConfirmUpload",
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index: resp_index,
                sub: resp_sub,
                data,
            } => {
                if index != resp_index || sub != resp_sub {
                    return MismatchedObjectIndexSnafu {
                        expected: (index, sub),
                        received: (resp_index, resp_sub),
                    }
                    .fail();
                }
                if e {
                    // When s is clear, CiA 301 leaves the length implementation-defined; assume
                    // the full 4 bytes are valid.
                    let len = if s { 4 - n as usize } else { 4 };
                    read_buf.extend_from_slice(&data[0..len]);
                }
                e
            }
        );

        if !expedited {
            let mut toggle = false;
            loop {
                let msg =
                    SdoRequest::upload_segment_request(toggle).to_can_message(self.req_cob_id);
                let resp = self.request_response(msg).await?;
                match_response!(
                    resp,
                    "UploadSegment",
                    SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            let abort_msg =
                                SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated)
                                    .to_can_message(self.req_cob_id);
                            self.send(abort_msg).await?;
                            return ToggleNotAlternatedSnafu.fail();
                        }
                        read_buf.extend_from_slice(&data[0..7 - n as usize]);
                        if c {
                            break;
                        }
                    }
                );
                toggle = !toggle;
            }
        }
        Ok(read_buf)
    }

    /// Perform a block download to transfer data to an object
    ///
    /// Block downloads are more efficient for large amounts of data, but may not be supported by
    /// all devices.
    pub async fn block_download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.receiver.flush();

        let msg = SdoRequest::initiate_block_download(index, sub, true, data.len() as u32)
            .to_can_message(self.req_cob_id);
        let resp = self.request_response(msg).await?;

        let (crc_enabled, mut blksize) = match_response!(
            resp,
            "ConfirmBlockDownload",
            SdoResponse::ConfirmBlockDownload {
                sc,
                index: resp_index,
                sub: resp_sub,
                blksize,
            } => {
                if index != resp_index || sub != resp_sub {
                    return MismatchedObjectIndexSnafu {
                        expected: (index, sub),
                        received: (resp_index, resp_sub),
                    }
                    .fail();
                }
                (sc, blksize)
            }
        );

        let mut seqnum = 1;
        let mut segment_num = 0;
        let total_segments = data.len().div_ceil(7);
        // Bytes actually sent in the last segment; stays 0 for a zero-length transfer, matching
        // the all-7-bytes-unused padding count that implies.
        let mut last_bytes_sent: usize = 0;

        while segment_num < total_segments {
            let segment_start = segment_num * 7;
            let segment_len = (data.len() - segment_start).min(7);
            let c = segment_start + segment_len == data.len();
            last_bytes_sent = segment_len;
            let mut segment_data = [0; 7];
            segment_data[0..segment_len]
                .copy_from_slice(&data[segment_start..segment_start + segment_len]);

            let segment = BlockSegment {
                c,
                seqnum,
                data: segment_data,
            };
            self.send(segment.to_can_message(self.req_cob_id)).await?;

            // Expect a confirmation after blksize segments are sent, or after the last segment
            if c || seqnum == blksize {
                let resp = self.wait_for_response(RESPONSE_TIMEOUT).await?;
                match_response!(
                    resp,
                    "ConfirmBlock",
                    SdoResponse::ConfirmBlock {
                        ackseq,
                        blksize: new_blksize,
                    } => {
                        // This implementation does not retransmit on a download ack mismatch; a
                        // partial block is treated as a protocol error.
                        if ackseq != blksize {
                            let abort_msg = SdoRequest::abort(
                                index,
                                sub,
                                AbortCode::InvalidSequenceNumber,
                            )
                            .to_can_message(self.req_cob_id);
                            self.send(abort_msg).await?;
                            return DataLossSnafu.fail();
                        }
                        seqnum = 1;
                        segment_num += 1;
                        blksize = new_blksize;
                    }
                );
            } else {
                seqnum += 1;
                segment_num += 1;
            }
        }

        let crc = if crc_enabled {
            crc16::State::<crc16::XMODEM>::calculate(data)
        } else {
            0
        };
        let n = (7 - last_bytes_sent) as u8;

        let msg = SdoRequest::end_block_download(n, crc).to_can_message(self.req_cob_id);
        let resp = self.request_response(msg).await?;
        match_response!(
            resp,
            "ConfirmBlockDownloadEnd",
            SdoResponse::ConfirmBlockDownloadEnd => { Ok(()) }
        )
    }

    /// Perform a block upload to read data from an object
    ///
    /// Block uploads are more efficient for large amounts of data, but may not be supported by
    /// all devices.
    pub async fn block_upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.receiver.flush();

        let blksize: u8 = 127;
        let msg = SdoRequest::initiate_block_upload(index, sub, blksize, 0)
            .to_can_message(self.req_cob_id);
        let resp = self.request_response(msg).await?;

        let crc_enabled = match_response!(
            resp,
            "ConfirmBlockUpload",
            SdoResponse::ConfirmBlockUpload {
                sc,
                index: resp_index,
                sub: resp_sub,
                ..
            } => {
                if index != resp_index || sub != resp_sub {
                    return MismatchedObjectIndexSnafu {
                        expected: (index, sub),
                        received: (resp_index, resp_sub),
                    }
                    .fail();
                }
                sc
            }
        );

        // The Start message has no response of its own: the first data frame is the response.
        self.send(SdoRequest::StartBlockUpload.to_can_message(self.req_cob_id))
            .await?;

        let mut data = Vec::new();
        let mut ackseq: u8 = 0;
        let mut last = false;

        while !last {
            let segment = self.recv_block_segment(ackseq, blksize).await?;
            ackseq = segment.seqnum;
            last = segment.c;
            data.extend_from_slice(&segment.data);

            if last || ackseq == blksize {
                let ack = SdoRequest::confirm_block_upload(ackseq, blksize)
                    .to_can_message(self.req_cob_id);
                self.send(ack).await?;
                if !last {
                    ackseq = 0;
                }
            }
        }

        let resp = self.wait_for_response(RESPONSE_TIMEOUT).await?;
        let (n, server_crc) = match_response!(
            resp,
            "BlockUploadEnd",
            SdoResponse::BlockUploadEnd { n, crc } => (n, crc)
        );

        let valid_len = data.len().saturating_sub(n as usize);
        data.truncate(valid_len);

        if crc_enabled {
            let computed = crc16::State::<crc16::XMODEM>::calculate(&data);
            if computed != server_crc {
                let abort_msg = SdoRequest::abort(index, sub, AbortCode::CrcError)
                    .to_can_message(self.req_cob_id);
                self.send(abort_msg).await?;
                return CrcMismatchSnafu.fail();
            }
        }

        self.send(SdoRequest::EndBlockUpload.to_can_message(self.req_cob_id))
            .await?;

        Ok(data)
    }

    /// Receive the next block-upload data frame, applying the retransmit protocol on a gap
    ///
    /// `ackseq` is the sequence number of the last segment accepted in the current block (0 if
    /// none yet); the next frame is expected to carry `ackseq + 1`.
    async fn recv_block_segment(&mut self, ackseq: u8, blksize: u8) -> Result<BlockSegment> {
        let expected = ackseq + 1;

        let msg = self.wait_for_message(RESPONSE_TIMEOUT).await?;
        let segment =
            BlockSegment::try_from(msg.data()).map_err(|_| MalformedResponseSnafu.build())?;
        if segment.seqnum == expected {
            return Ok(segment);
        }

        // Retransmit protocol: reassert the last good ack and give the server one more chance.
        let ack =
            SdoRequest::confirm_block_upload(ackseq, blksize).to_can_message(self.req_cob_id);
        self.send(ack).await?;

        let msg = self
            .wait_for_message(RESPONSE_TIMEOUT)
            .await
            .map_err(|_| DataLossSnafu.build())?;
        let segment =
            BlockSegment::try_from(msg.data()).map_err(|_| MalformedResponseSnafu.build())?;
        if segment.seqnum != expected {
            return DataLossSnafu.fail();
        }
        Ok(segment)
    }

    /// Open a sub-object for streaming read or write access
    ///
    /// Dispatches to the segmented or block transfer engines depending on `block_transfer`. A
    /// read runs the whole upload to completion immediately and hands back the result through an
    /// [`SdoReader`]; a write buffers bytes in an [`SdoWriter`] until [`SdoWriter::close`] is
    /// called. `size`, if given, is checked against the transferred length on both sides.
    pub async fn open(
        &mut self,
        index: u16,
        sub: u8,
        mode: OpenMode,
        size: Option<usize>,
        block_transfer: bool,
    ) -> Result<SdoStream<'_, S, R>> {
        match mode {
            OpenMode::Read => {
                let data = if block_transfer {
                    self.block_upload(index, sub).await?
                } else {
                    self.upload(index, sub).await?
                };
                if let Some(expected) = size {
                    if data.len() != expected {
                        return UnexpectedSizeSnafu.fail();
                    }
                }
                Ok(SdoStream::Reader(SdoReader { data, pos: 0 }))
            }
            OpenMode::Write => Ok(SdoStream::Writer(SdoWriter {
                client: self,
                index,
                sub,
                size,
                block_transfer,
                buf: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Write to a u32 object on the SDO server
    pub async fn download_u32(&mut self, index: u16, sub: u8, data: u32) -> Result<()> {
        let data = data.to_le_bytes();
        self.download(index, sub, &data).await
    }

    /// Alias for `download_u32`
    pub async fn write_u32(&mut self, index: u16, sub: u8, data: u32) -> Result<()> {
        self.download_u32(index, sub, data).await
    }

    /// Write to a u16 object on the SDO server
    pub async fn download_u16(&mut self, index: u16, sub: u8, data: u16) -> Result<()> {
        let data = data.to_le_bytes();
        self.download(index, sub, &data).await
    }

    /// Alias for `download_u16`
    pub async fn write_u16(&mut self, index: u16, sub: u8, data: u16) -> Result<()> {
        self.download_u16(index, sub, data).await
    }

    /// Write to a u8 object on the SDO server
    pub async fn download_u8(&mut self, index: u16, sub: u8, data: u8) -> Result<()> {
        let data = data.to_le_bytes();
        self.download(index, sub, &data).await
    }

    /// Alias for `download_u8`
    pub async fn write_u8(&mut self, index: u16, sub: u8, data: u8) -> Result<()> {
        self.download_u8(index, sub, data).await
    }

    /// Write to an i32 object on the SDO server
    pub async fn download_i32(&mut self, index: u16, sub: u8, data: i32) -> Result<()> {
        let data = data.to_le_bytes();
        self.download(index, sub, &data).await
    }

    /// Alias for `download_i32`
    pub async fn write_i32(&mut self, index: u16, sub: u8, data: i32) -> Result<()> {
        self.download_i32(index, sub, data).await
    }

    /// Write to an i16 object on the SDO server
    pub async fn download_i16(&mut self, index: u16, sub: u8, data: i16) -> Result<()> {
        let data = data.to_le_bytes();
        self.download(index, sub, &data).await
    }

    /// Alias for `download_i16`
    pub async fn write_i16(&mut self, index: u16, sub: u8, data: i16) -> Result<()> {
        self.download_i16(index, sub, data).await
    }

    /// Write to an i8 object on the SDO server
    pub async fn download_i8(&mut self, index: u16, sub: u8, data: i8) -> Result<()> {
        let data = data.to_le_bytes();
        self.download(index, sub, &data).await
    }

    /// Alias for `download_i8`
    pub async fn write_i8(&mut self, index: u16, sub: u8, data: i8) -> Result<()> {
        self.download_i8(index, sub, data).await
    }

    /// Read a string from the SDO server
    pub async fn upload_utf8(&mut self, index: u16, sub: u8) -> Result<String> {
        let data = self.upload(index, sub).await?;
        Ok(String::from_utf8_lossy(&data).into())
    }

    /// Alias for `upload_utf8`
    pub async fn read_utf8(&mut self, index: u16, sub: u8) -> Result<String> {
        self.upload_utf8(index, sub).await
    }

    /// Read a sub-object from the SDO server, assuming it is a u8
    pub async fn upload_u8(&mut self, index: u16, sub: u8) -> Result<u8> {
        let data = self.upload(index, sub).await?;
        if data.len() != 1 {
            return UnexpectedSizeSnafu.fail();
        }
        Ok(data[0])
    }

    /// Alias for `upload_u8`
    pub async fn read_u8(&mut self, index: u16, sub: u8) -> Result<u8> {
        self.upload_u8(index, sub).await
    }

    /// Read a sub-object from the SDO server, assuming it is a u16
    pub async fn upload_u16(&mut self, index: u16, sub: u8) -> Result<u16> {
        let data = self.upload(index, sub).await?;
        if data.len() != 2 {
            return UnexpectedSizeSnafu.fail();
        }
        Ok(u16::from_le_bytes(data.try_into().unwrap()))
    }

    /// Alias for `upload_u16`
    pub async fn read_u16(&mut self, index: u16, sub: u8) -> Result<u16> {
        self.upload_u16(index, sub).await
    }

    /// Read a sub-object from the SDO server, assuming it is a u32
    pub async fn upload_u32(&mut self, index: u16, sub: u8) -> Result<u32> {
        let data = self.upload(index, sub).await?;
        if data.len() != 4 {
            return UnexpectedSizeSnafu.fail();
        }
        Ok(u32::from_le_bytes(data.try_into().unwrap()))
    }

    /// Alias for `upload_u32`
    pub async fn read_u32(&mut self, index: u16, sub: u8) -> Result<u32> {
        self.upload_u32(index, sub).await
    }

    /// Read a sub-object from the SDO server, assuming it is an i8
    pub async fn upload_i8(&mut self, index: u16, sub: u8) -> Result<i8> {
        let data = self.upload(index, sub).await?;
        if data.len() != 1 {
            return UnexpectedSizeSnafu.fail();
        }
        Ok(i8::from_le_bytes(data.try_into().unwrap()))
    }

    /// Alias for `upload_i8`
    pub async fn read_i8(&mut self, index: u16, sub: u8) -> Result<i8> {
        self.upload_i8(index, sub).await
    }

    /// Read a sub-object from the SDO server, assuming it is an i16
    pub async fn upload_i16(&mut self, index: u16, sub: u8) -> Result<i16> {
        let data = self.upload(index, sub).await?;
        if data.len() != 2 {
            return UnexpectedSizeSnafu.fail();
        }
        Ok(i16::from_le_bytes(data.try_into().unwrap()))
    }

    /// Alias for `upload_i16`
    pub async fn read_i16(&mut self, index: u16, sub: u8) -> Result<i16> {
        self.upload_i16(index, sub).await
    }

    /// Read a sub-object from the SDO server, assuming it is an i32
    pub async fn upload_i32(&mut self, index: u16, sub: u8) -> Result<i32> {
        let data = self.upload(index, sub).await?;
        if data.len() != 4 {
            return UnexpectedSizeSnafu.fail();
        }
        Ok(i32::from_le_bytes(data.try_into().unwrap()))
    }

    /// Alias for `upload_i32`
    pub async fn read_i32(&mut self, index: u16, sub: u8) -> Result<i32> {
        self.upload_i32(index, sub).await
    }

    /// Read an object as a visible string, assumed to contain valid UTF-8
    pub async fn read_visible_string(&mut self, index: u16, sub: u8) -> Result<String> {
        let bytes = self.upload(index, sub).await?;
        Ok(String::from_utf8_lossy(&bytes).into())
    }

    /// Send an abort frame for the given object, terminating any transfer the server has in
    /// progress for it
    pub async fn abort(&mut self, index: u16, sub: u8, abort_code: AbortCode) -> Result<()> {
        let msg = SdoRequest::abort(index, sub, abort_code).to_can_message(self.req_cob_id);
        self.send(msg).await
    }

    /// Send a request and retry on transient send failure, without awaiting a response
    async fn send(&mut self, msg: CanMessage) -> Result<()> {
        let mut pending = msg;
        for attempt in 0..=MAX_RETRIES {
            match self.sender.send(pending).await {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    if attempt == MAX_RETRIES {
                        return SocketSendFailedSnafu.fail();
                    }
                    pending = returned;
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
            }
        }
        SocketSendFailedSnafu.fail()
    }

    /// Send a request and wait for a matching response, retrying the whole round trip up to
    /// `MAX_RETRIES` times on timeout
    async fn request_response(&mut self, msg: CanMessage) -> Result<SdoResponse> {
        for attempt in 0..=MAX_RETRIES {
            self.send(msg).await?;
            match self.wait_for_response(RESPONSE_TIMEOUT).await {
                Ok(resp) => return Ok(resp),
                Err(SdoClientError::NoResponse) if attempt < MAX_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
        NoResponseSnafu.fail()
    }

    /// Wait for the next frame on the response COB-ID, decoded as an [`SdoResponse`]
    async fn wait_for_response(&mut self, timeout: Duration) -> Result<SdoResponse> {
        let msg = self.wait_for_message(timeout).await?;
        msg.try_into().map_err(|_| MalformedResponseSnafu.build())
    }

    /// Wait for the next raw frame on the response COB-ID
    ///
    /// Used directly by block upload's data phase, whose frames don't share the command-byte
    /// layout [`SdoResponse`] decodes.
    async fn wait_for_message(&mut self, timeout: Duration) -> Result<CanMessage> {
        let wait_until = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(wait_until, self.receiver.recv()).await {
                Err(_) => return NoResponseSnafu.fail(),
                Ok(Ok(msg)) => {
                    if msg.id == self.resp_cob_id {
                        return Ok(msg);
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Error reading from transport: {e:?}");
                    return NoResponseSnafu.fail();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeSender {
        sent: VecDeque<CanMessage>,
    }

    impl AsyncCanSender for FakeSender {
        async fn send(&mut self, msg: CanMessage) -> std::result::Result<(), CanMessage> {
            self.sent.push_back(msg);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReceiver {
        queue: VecDeque<CanMessage>,
    }

    impl AsyncCanReceiver for FakeReceiver {
        type Error = ();

        fn try_recv(&mut self) -> Option<CanMessage> {
            self.queue.pop_front()
        }

        async fn recv(&mut self) -> std::result::Result<CanMessage, Self::Error> {
            loop {
                if let Some(msg) = self.queue.pop_front() {
                    return Ok(msg);
                }
                tokio::task::yield_now().await;
            }
        }
    }

    fn client(resp: CanId) -> (SdoClient<FakeSender, FakeReceiver>, CanId) {
        let req_cob_id = CanId::Std(0x601);
        let resp_cob_id = resp;
        (
            SdoClient::with_cobids(
                req_cob_id,
                resp_cob_id,
                FakeSender::default(),
                FakeReceiver::default(),
            ),
            req_cob_id,
        )
    }

    #[tokio::test]
    async fn expedited_upload_decodes_payload() {
        let (mut c, _req) = client(CanId::Std(0x581));
        c.receiver
            .queue
            .push_back(CanMessage::new(
                CanId::Std(0x581),
                &[0x4B, 0x17, 0x10, 0, 0x34, 0x12, 0, 0],
            ));

        let data = c.upload(0x1017, 0).await.unwrap();
        assert_eq!(data, vec![0x34, 0x12]);
    }

    #[tokio::test]
    async fn expedited_download_request_matches_wire_layout() {
        let (mut c, req) = client(CanId::Std(0x581));
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x60, 0x00, 0x14, 0x02, 0, 0, 0, 0],
        ));

        c.download(0x1400, 2, &1u32.to_le_bytes()).await.unwrap();

        let sent = c.sender.sent.pop_front().unwrap();
        assert_eq!(sent.id, req);
        assert_eq!(sent.data(), [0x23, 0x00, 0x14, 0x02, 0x01, 0, 0, 0]);
    }

    #[tokio::test]
    async fn server_abort_surfaces_as_error() {
        let (mut c, _req) = client(CanId::Std(0x581));
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x80, 0x00, 0x10, 0x00, 0x02, 0x00, 0x01, 0x06],
        ));

        let err = c.download(0x1000, 0, &[0x42]).await.unwrap_err();
        match err {
            SdoClientError::ServerAbort {
                index,
                sub,
                abort_code,
            } => {
                assert_eq!((index, sub), (0x1000, 0));
                assert_eq!(abort_code, RawAbortCode::Valid(AbortCode::ReadOnly));
            }
            other => panic!("expected ServerAbort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_response_times_out() {
        let (mut c, _req) = client(CanId::Std(0x581));
        let err = c.upload(0x1000, 0).await.unwrap_err();
        assert_eq!(err, SdoClientError::NoResponse);
    }

    #[tokio::test]
    async fn segmented_upload_alternates_toggle_and_concatenates() {
        let (mut c, _req) = client(CanId::Std(0x581));
        // Initiate: segmented, size=10
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x41, 0x08, 0x10, 0, 10, 0, 0, 0],
        ));
        // Segment 1: toggle=0, full 7 bytes
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x00, 1, 2, 3, 4, 5, 6, 7],
        ));
        // Segment 2: toggle=1, n=4 unused, last
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x1D, 8, 9, 10, 0, 0, 0, 0],
        ));

        let data = c.upload(0x1008, 0).await.unwrap();
        assert_eq!(data, (1..=10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn block_upload_assembles_segments_and_checks_crc() {
        let (mut c, _req) = client(CanId::Std(0x581));

        let payload: Vec<u8> = (1..=14u8).collect();
        let crc = crc16::State::<crc16::XMODEM>::calculate(&payload);

        // ConfirmBlockUpload: sc=1, s=1, size=14
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0xC6, 0x08, 0x10, 0, 14, 0, 0, 0],
        ));
        // Segment 1
        let mut seg1 = [0u8; 8];
        seg1[0] = 1;
        seg1[1..8].copy_from_slice(&payload[0..7]);
        c.receiver
            .queue
            .push_back(CanMessage::new(CanId::Std(0x581), &seg1));
        // Segment 2, last (bit7 set), only 7 valid bytes so n=0
        let mut seg2 = [0u8; 8];
        seg2[0] = 0x80 | 2;
        seg2[1..8].copy_from_slice(&payload[7..14]);
        c.receiver
            .queue
            .push_back(CanMessage::new(CanId::Std(0x581), &seg2));
        // BlockUploadEnd: n=0, crc
        let mut end = [0u8; 8];
        end[0] = 0xC1;
        end[1..3].copy_from_slice(&crc.to_le_bytes());
        c.receiver
            .queue
            .push_back(CanMessage::new(CanId::Std(0x581), &end));

        let data = c.block_upload(0x1008, 0).await.unwrap();
        assert_eq!(data, payload);
    }

    #[tokio::test]
    async fn block_upload_crc_mismatch_aborts() {
        let (mut c, _req) = client(CanId::Std(0x581));

        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0xC6, 0x08, 0x10, 0, 7, 0, 0, 0],
        ));
        let mut seg = [0u8; 8];
        seg[0] = 0x80 | 1;
        seg[1..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        c.receiver
            .queue
            .push_back(CanMessage::new(CanId::Std(0x581), &seg));
        let mut end = [0u8; 8];
        end[0] = 0xC1;
        end[1..3].copy_from_slice(&0xBEEFu16.to_le_bytes());
        c.receiver
            .queue
            .push_back(CanMessage::new(CanId::Std(0x581), &end));

        let err = c.block_upload(0x1008, 0).await.unwrap_err();
        assert_eq!(err, SdoClientError::CrcMismatch);
    }

    #[tokio::test]
    async fn block_download_ack_mismatch_aborts_instead_of_retransmitting() {
        let (mut c, _req) = client(CanId::Std(0x581));

        // ConfirmBlockDownload: sc=1, blksize=127
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0xA4, 0x08, 0x10, 0, 127, 0, 0, 0],
        ));
        // ConfirmBlock ack with ackseq=0 (should be 1): a gap the server is reporting
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0xA2, 0, 127, 0, 0, 0, 0, 0],
        ));

        let err = c.block_download(0x1008, 0, &[1, 2, 3]).await.unwrap_err();
        assert_eq!(err, SdoClientError::DataLoss);

        // An abort frame, not a retransmitted segment, should have followed the short write
        let last_sent = c.sender.sent.back().unwrap();
        assert_eq!(last_sent.data()[0] >> 5, 4); // abort command class
    }

    #[tokio::test]
    async fn upload_rejects_response_for_a_different_object() {
        let (mut c, _req) = client(CanId::Std(0x581));
        // ConfirmUpload, but echoing 0x1018 instead of the requested 0x1017
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x4B, 0x18, 0x10, 0, 0x34, 0x12, 0, 0],
        ));

        let err = c.upload(0x1017, 0).await.unwrap_err();
        match err {
            SdoClientError::MismatchedObjectIndex { expected, received } => {
                assert_eq!(expected, (0x1017, 0));
                assert_eq!(received, (0x1018, 0));
            }
            other => panic!("expected MismatchedObjectIndex, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn block_download_empty_payload_uses_full_padding() {
        let (mut c, _req) = client(CanId::Std(0x581));
        // ConfirmBlockDownload: sc=1, blksize=127
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0xA4, 0x08, 0x10, 0, 127, 0, 0, 0],
        ));
        // ConfirmBlockDownloadEnd
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0xA1, 0, 0, 0, 0, 0, 0, 0],
        ));

        c.block_download(0x1008, 0, &[]).await.unwrap();

        // No segments were ever sent, so n must be 7 (all 7 bytes of a never-sent frame are
        // unused), not 0.
        let end_req = c.sender.sent.back().unwrap();
        assert_eq!(end_req.data()[0], 0xBD);
    }

    #[tokio::test]
    async fn open_for_read_dispatches_to_expedited_upload() {
        let (mut c, _req) = client(CanId::Std(0x581));
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x4B, 0x17, 0x10, 0, 0x34, 0x12, 0, 0],
        ));

        let stream = c
            .open(0x1017, 0, OpenMode::Read, Some(2), false)
            .await
            .unwrap();
        let mut reader = match stream {
            SdoStream::Reader(r) => r,
            SdoStream::Writer(_) => panic!("expected a reader"),
        };
        assert_eq!(reader.size(), 2);
        assert_eq!(reader.read_to_end(), vec![0x34, 0x12]);
    }

    #[tokio::test]
    async fn open_for_write_buffers_until_close() {
        let (mut c, _req) = client(CanId::Std(0x581));
        // ConfirmDownload echoed once close() dispatches the write
        c.receiver.queue.push_back(CanMessage::new(
            CanId::Std(0x581),
            &[0x60, 0x17, 0x10, 0, 0, 0, 0, 0],
        ));

        let stream = c
            .open(0x1017, 0, OpenMode::Write, None, false)
            .await
            .unwrap();
        let mut writer = match stream {
            SdoStream::Writer(w) => w,
            SdoStream::Reader(_) => panic!("expected a writer"),
        };
        writer.write(&[0x34, 0x12]);
        assert_eq!(writer.pos(), 2);
        writer.close().await.unwrap();

        let sent = c.sender.sent.back().unwrap();
        assert_eq!(sent.data()[1..3], [0x17, 0x10]);
    }
}
