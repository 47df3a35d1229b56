//! DFU Packet characteristic writes and the firmware streaming loop.
//!
//! Everything written here is a Write Command. Flow control comes either
//! from Packet Receipt Notifications, every `prn` packets, or with PRNs
//! disabled, from the transport's own outgoing queue.
//!
//! Legacy DFU streams the whole image in one go. Secure DFU streams it one
//! object at a time: the session is then bounded by
//! [`TransferSession::start_object`] and PRNs count packets of that object.

use std::time::Instant;

use tracing::{debug, info};
use uuid::Uuid;

use super::config::LEGACY_PACKET_SIZE;
use super::control_point::PacketReceiptNotification;
use super::error::{DfuError, DfuResult};
use super::firmware::FirmwareSize;
use super::transport::{GattTransport, WriteKind};

/// Upload progress of the current part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// Whole percent of the part, 0..=100.
    pub percent: u8,
    /// Bytes per second since the previous report.
    pub current_speed: f64,
    /// Bytes per second since the upload started.
    pub average_speed: f64,
}

/// DFU Packet characteristic.
#[derive(Debug, Clone)]
pub struct DfuPacket {
    uuid: Uuid,
    packet_size: usize,
}

impl DfuPacket {
    /// Packets are capped at 20 bytes, the only size Legacy DFU accepts, or
    /// the link maximum if that is smaller.
    pub fn new<T: GattTransport + ?Sized>(uuid: Uuid, transport: &T) -> Self {
        let limit = transport.maximum_write_length(WriteKind::WithoutResponse);
        Self {
            uuid,
            packet_size: LEGACY_PACKET_SIZE.min(limit).max(1),
        }
    }

    /// Packets as large as the link allows, for Secure DFU bootloaders.
    pub fn sized_to_link<T: GattTransport + ?Sized>(uuid: Uuid, transport: &T) -> Self {
        Self {
            uuid,
            packet_size: transport
                .maximum_write_length(WriteKind::WithoutResponse)
                .max(1),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// The `<softdevice, bootloader, application>` record following Start DFU.
    pub fn write_sizes<T: GattTransport + ?Sized>(&self, size: &FirmwareSize, transport: &mut T) {
        debug!(
            "Sending firmware sizes (SD: {}, BL: {}, App: {})",
            size.softdevice, size.bootloader, size.application
        );
        self.write(&size.to_le_bytes(), transport);
    }

    /// Application size only, following the type-less Start DFU.
    pub fn write_application_size<T: GattTransport + ?Sized>(
        &self,
        size: &FirmwareSize,
        transport: &mut T,
    ) {
        debug!("Sending application size ({})", size.application);
        self.write(&size.application.to_le_bytes(), transport);
    }

    pub fn write_init_packet<T: GattTransport + ?Sized>(&self, data: &[u8], transport: &mut T) {
        debug!("Sending init packet ({} bytes)", data.len());
        for chunk in data.chunks(self.packet_size) {
            self.write(chunk, transport);
        }
    }

    fn write<T: GattTransport + ?Sized>(&self, value: &[u8], transport: &mut T) {
        transport.write(self.uuid, value, WriteKind::WithoutResponse);
    }
}

/// State of one part upload, dropped when it completes, fails or is aborted.
#[derive(Debug, Default)]
pub struct TransferSession {
    bytes_sent: usize,
    bytes_sent_at_last_tick: usize,
    /// Offset the device already held when the session started.
    resumed_from: usize,
    /// End of the current Secure DFU object, exclusive.
    object_end: Option<usize>,
    progress_reported: Option<u8>,
    started_at: Option<Instant>,
    last_tick_at: Option<Instant>,
    paused: bool,
    aborted: bool,
    /// A full PRN batch went out and its receipt has not arrived yet.
    awaiting_receipt: bool,
}

impl TransferSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session continuing from bytes the device reported as received.
    pub fn resuming_at(offset: usize) -> Self {
        Self {
            bytes_sent: offset,
            bytes_sent_at_last_tick: offset,
            resumed_from: offset,
            ..Self::default()
        }
    }

    /// Bound the next batches to `start..end`, rewinding when an object is
    /// sent again.
    pub fn start_object(&mut self, start: usize, end: usize) {
        self.bytes_sent = start;
        self.object_end = Some(end);
        self.awaiting_receipt = false;
    }

    /// Every byte of the current object is out and no receipt is pending.
    pub fn is_object_complete(&self) -> bool {
        self.object_end.is_some_and(|end| self.bytes_sent >= end) && !self.awaiting_receipt
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Clear the pause flag. Returns true when the caller should continue
    /// with [`send_next`](Self::send_next) right away.
    pub fn resume(&mut self) -> bool {
        let was_paused = std::mem::replace(&mut self.paused, false);
        was_paused && !self.aborted && !self.awaiting_receipt
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Check a PRN against what was sent.
    ///
    /// Only the 16 least significant bits are compared, as some bootloaders
    /// report the count in a 16-bit field.
    pub fn verify_receipt(&mut self, receipt: PacketReceiptNotification) -> DfuResult<()> {
        self.awaiting_receipt = false;
        let sent = self.bytes_sent as u32;
        if sent & 0xFFFF != receipt.bytes_received & 0xFFFF {
            return Err(DfuError::BytesLost {
                sent,
                received: receipt.bytes_received,
            });
        }
        Ok(())
    }

    /// Check a Secure DFU receipt, which reports the full offset.
    pub fn verify_offset(&mut self, offset: u32) -> DfuResult<()> {
        self.awaiting_receipt = false;
        let sent = self.bytes_sent as u32;
        if sent != offset {
            return Err(DfuError::BytesLost {
                sent,
                received: offset,
            });
        }
        Ok(())
    }

    /// Send the next batch of packets: `prn` of them, or everything left
    /// when PRNs are disabled. Returns the number of packets written.
    pub fn send_next<T, F>(
        &mut self,
        prn: u16,
        data: &[u8],
        packet: &DfuPacket,
        transport: &mut T,
        now: Instant,
        mut on_progress: F,
    ) -> usize
    where
        T: GattTransport + ?Sized,
        F: FnMut(TransferProgress),
    {
        if self.paused || self.aborted {
            return 0;
        }

        let packet_size = packet.packet_size();
        let total = data.len();
        let end_of_batch = self.object_end.map_or(total, |end| end.min(total));
        let remaining = end_of_batch.saturating_sub(self.bytes_sent).div_ceil(packet_size);
        let to_send = match prn {
            0 => remaining,
            prn => remaining.min(prn as usize),
        };

        let started_at = *self.started_at.get_or_insert(now);
        if self.progress_reported.is_none() {
            info!("Uploading firmware ({} bytes)", total);
            self.last_tick_at = Some(now);
            self.progress_reported = Some(0);
            on_progress(TransferProgress {
                percent: 0,
                current_speed: 0.0,
                average_speed: 0.0,
            });
        }

        for _ in 0..to_send {
            let end = (self.bytes_sent + packet_size).min(end_of_batch);
            packet.write(&data[self.bytes_sent..end], transport);
            self.bytes_sent = end;

            let percent = (self.bytes_sent * 100 / total) as u8;
            if percent <= self.progress_reported.unwrap_or(0) {
                continue;
            }

            let last_tick_at = self.last_tick_at.unwrap_or(started_at);
            let progress = TransferProgress {
                percent,
                current_speed: bytes_per_second(
                    self.bytes_sent - self.bytes_sent_at_last_tick,
                    now.saturating_duration_since(last_tick_at).as_secs_f64(),
                ),
                average_speed: bytes_per_second(
                    self.bytes_sent - self.resumed_from,
                    now.saturating_duration_since(started_at).as_secs_f64(),
                ),
            };
            self.progress_reported = Some(percent);
            self.bytes_sent_at_last_tick = self.bytes_sent;
            self.last_tick_at = Some(now);
            on_progress(progress);
        }

        // A full batch is always followed by a receipt
        self.awaiting_receipt = prn > 0 && to_send == usize::from(prn);
        to_send
    }
}

fn bytes_per_second(bytes: usize, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes as f64 / seconds
    } else {
        0.0
    }
}
