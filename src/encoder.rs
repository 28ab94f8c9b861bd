//! Encoder seam and per-variant runtime state
//!
//! Codec internals live behind the [`Encoder`] trait: bind to a segment
//! directory, encode frames, flush buffered output at a boundary.
//! [`EncoderSlot`] wraps one variant's encoder with the pipeline's
//! failure policy: a bind failure disables the variant for the rest of
//! the process, an encode failure is retried once and then recorded as a
//! gap, and boundary flushes are mandatory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, warn};

use crate::bus::{EncodeIndex, LocalBus};
use crate::registry::EncoderVariant;
use crate::vision::VisionFrame;

/// One encoder instance: hardware, software, or simulated.
pub trait Encoder: Send {
    /// Open output for a new segment, closing any previous output.
    fn bind(&mut self, segment_dir: &Path) -> Result<()>;

    /// Encode one frame; returns the encoded byte size.
    fn encode(&mut self, frame: &VisionFrame) -> Result<u64>;

    /// Force buffered frames out before segment close. Mandatory at
    /// boundaries; skipping it truncates video.
    fn flush(&mut self) -> Result<()>;
}

/// Writes length-prefixed encoded payloads to the variant's file within
/// the segment directory, or nothing for non-recorded variants.
pub struct WriterEncoder {
    file_name: Option<String>,
    writer: Option<BufWriter<File>>,
}

impl WriterEncoder {
    pub fn new(file_name: Option<&str>) -> Self {
        Self {
            file_name: file_name.map(str::to_string),
            writer: None,
        }
    }

    /// Build one encoder per variant of a camera.
    pub fn for_variants(variants: &[EncoderVariant]) -> Vec<Box<dyn Encoder>> {
        variants
            .iter()
            .map(|v| {
                let file_name = if v.record { v.file_name } else { None };
                Box::new(WriterEncoder::new(file_name)) as Box<dyn Encoder>
            })
            .collect()
    }
}

impl Encoder for WriterEncoder {
    fn bind(&mut self, segment_dir: &Path) -> Result<()> {
        // Close the previous segment's file, if any
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("closing previous segment file")?;
        }
        if let Some(name) = &self.file_name {
            let path = segment_dir.join(name);
            let file = File::create(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(())
    }

    fn encode(&mut self, frame: &VisionFrame) -> Result<u64> {
        let len = frame.data.len() as u64;
        if let Some(writer) = &mut self.writer {
            writer.write_all(&(frame.data.len() as u32).to_le_bytes())?;
            writer.write_all(&frame.data)?;
            return Ok(len + 4);
        }
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// One variant's runtime state within a camera thread.
pub struct EncoderSlot {
    pub variant: EncoderVariant,
    encoder: Box<dyn Encoder>,
    active: bool,
    /// Frames this segment that failed encoding after retry
    gaps: u32,
}

impl EncoderSlot {
    pub fn new(variant: EncoderVariant, encoder: Box<dyn Encoder>) -> Self {
        Self {
            variant,
            encoder,
            active: true,
            gaps: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn gaps(&self) -> u32 {
        self.gaps
    }

    /// Bind to a new segment's output. Failure disables the variant for
    /// the remainder of the process; the camera continues degraded.
    pub fn bind_segment(&mut self, segment_dir: &Path) {
        if !self.active {
            return;
        }
        if let Err(e) = self.encoder.bind(segment_dir) {
            error!(
                variant = self.variant.publish_name,
                error = %e,
                "encoder bind failed, disabling variant"
            );
            self.active = false;
        }
        self.gaps = 0;
    }

    /// Encode one frame and publish its index event. A failed submission
    /// is retried once; a second failure records a gap. `frame_index`
    /// still advances camera-wide, so gaps are visible, not compacted.
    pub fn encode(
        &mut self,
        frame: &VisionFrame,
        segment_index: u64,
        frame_index: u32,
        bus: &LocalBus,
    ) {
        if !self.active {
            return;
        }

        let encoded_size = match self.encoder.encode(frame) {
            Ok(size) => size,
            Err(first) => {
                warn!(
                    variant = self.variant.publish_name,
                    frame_id = frame.frame_id,
                    error = %first,
                    "encode failed, retrying once"
                );
                match self.encoder.encode(frame) {
                    Ok(size) => size,
                    Err(second) => {
                        self.gaps += 1;
                        warn!(
                            variant = self.variant.publish_name,
                            frame_id = frame.frame_id,
                            frame_index,
                            error = %second,
                            "encode retry failed, dropping frame"
                        );
                        return;
                    }
                }
            }
        };

        bus.publish(
            self.variant.publish_name,
            EncodeIndex {
                segment_index,
                frame_index,
                source_frame_id: frame.frame_id,
                encoded_size,
                codec: self.variant.codec,
            },
        );
    }

    /// Flush buffered frames at a segment boundary. A flush failure is a
    /// truncated-output risk: reported loudly and the variant disabled.
    pub fn flush(&mut self) {
        if !self.active {
            return;
        }
        if self.gaps > 0 {
            warn!(
                variant = self.variant.publish_name,
                gaps = self.gaps,
                "segment closed with encode gaps"
            );
        }
        if let Err(e) = self.encoder.flush() {
            error!(
                variant = self.variant.publish_name,
                error = %e,
                "encoder flush failed, disabling variant"
            );
            self.active = false;
        }
    }
}
