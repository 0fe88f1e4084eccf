//! Streaming writer for profile files.
//!
//! The writer is driven section by section:
//!
//! ```no_run
//! # use perch_profile_format::writer::ProfileWriter;
//! # fn demo() -> Result<(), perch_profile_format::FormatError> {
//! # let file = std::io::Cursor::new(Vec::new());
//! let mut w = ProfileWriter::new(file);
//! w.write_header(&[("program".into(), "a.out".into())])?;
//! // per epoch, newest first:
//! w.write_loadmap(&[])?;
//! w.write_cct(std::iter::empty())?;
//! w.write_metric_table(&[])?;
//! w.write_identity_tuple(&Default::default())?;
//! w.write_sparse_index(&Default::default())?;
//! let _file = w.finish()?;
//! # Ok(())
//! # }
//! ```
//!
//! Section positions are captured as they are written; `finish` pads to the
//! final section boundary and appends the footer.

use std::io::{Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};

use crate::{
    align_up, CctNodeRecord, Footer, FormatError, IdentityTuple, LoadmapEntry, MetricTableEntry,
    SparseMetricIndex, FOOTER_MAGIC,
};

pub struct ProfileWriter<W: Write + Seek> {
    w: W,
    footer: Footer,
}

impl<W: Write + Seek> ProfileWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            footer: Footer::default(),
        }
    }

    /// Writes the name/value header. Must be called first, exactly once.
    pub fn write_header(&mut self, pairs: &[(String, String)]) -> Result<(), FormatError> {
        self.footer.hdr_start = self.w.stream_position()?;
        self.w.write_u32::<BigEndian>(pairs.len() as u32)?;
        for (name, value) in pairs {
            write_string(&mut self.w, name)?;
            write_string(&mut self.w, value)?;
        }
        self.footer.hdr_end = self.w.stream_position()?;
        self.pad_to_boundary()
    }

    /// Writes an epoch's load map section.
    pub fn write_loadmap(&mut self, entries: &[LoadmapEntry]) -> Result<(), FormatError> {
        self.footer.loadmap_start = self.w.stream_position()?;
        self.w.write_u32::<BigEndian>(entries.len() as u32)?;
        for entry in entries {
            self.w.write_u16::<BigEndian>(entry.id)?;
            write_string(&mut self.w, &entry.name)?;
            self.w.write_u32::<BigEndian>(entry.flags)?;
        }
        self.footer.loadmap_end = self.w.stream_position()?;
        self.pad_to_boundary()
    }

    /// Writes an epoch's calling-context tree as a pre-order node stream.
    ///
    /// The iterator must yield the root (node id 0) first and every other
    /// node after its parent. The node count is back-patched, so the
    /// iterator may be lazy.
    pub fn write_cct(
        &mut self,
        nodes: impl Iterator<Item = CctNodeRecord>,
    ) -> Result<(), FormatError> {
        self.footer.cct_start = self.w.stream_position()?;
        // Count slot, patched once the stream has been drained.
        self.w.write_u32::<BigEndian>(0)?;
        let mut count = 0u32;
        for node in nodes {
            self.w.write_u32::<BigEndian>(node.node_id)?;
            self.w.write_u32::<BigEndian>(node.parent_id)?;
            self.w.write_u16::<BigEndian>(node.lm_id)?;
            self.w.write_u64::<BigEndian>(node.lm_offset)?;
            self.w.write_u16::<BigEndian>(node.metrics.len() as u16)?;
            for &(metric_id, value) in &node.metrics {
                self.w.write_u16::<BigEndian>(metric_id)?;
                self.w.write_f64::<BigEndian>(value)?;
            }
            count += 1;
        }
        let end = self.w.stream_position()?;
        self.w.seek(SeekFrom::Start(self.footer.cct_start))?;
        self.w.write_u32::<BigEndian>(count)?;
        self.w.seek(SeekFrom::Start(end))?;
        self.footer.cct_end = end;
        self.pad_to_boundary()
    }

    /// Writes an epoch's metric table.
    pub fn write_metric_table(&mut self, entries: &[MetricTableEntry]) -> Result<(), FormatError> {
        self.footer.met_tbl_start = self.w.stream_position()?;
        self.w.write_u32::<BigEndian>(entries.len() as u32)?;
        for entry in entries {
            write_string(&mut self.w, &entry.name)?;
            write_string(&mut self.w, &entry.unit)?;
            self.w.write_u32::<BigEndian>(entry.flags)?;
            self.w.write_u64::<BigEndian>(entry.period)?;
        }
        self.footer.met_tbl_end = self.w.stream_position()?;
        self.pad_to_boundary()
    }

    /// Writes the identity-tuple dictionary section. Not footer-indexed;
    /// readers locate it at the boundary after the metric table.
    pub fn write_identity_tuple(&mut self, idt: &IdentityTuple) -> Result<(), FormatError> {
        self.w.write_u32::<BigEndian>(idt.dictionary.len() as u32)?;
        for (kind, label) in &idt.dictionary {
            self.w.write_u16::<BigEndian>(*kind)?;
            write_string(&mut self.w, label)?;
        }
        self.w.write_u16::<BigEndian>(idt.tuple.len() as u16)?;
        for &(kind, value) in &idt.tuple {
            self.w.write_u16::<BigEndian>(kind)?;
            self.w.write_u64::<BigEndian>(value)?;
        }
        self.pad_to_boundary()
    }

    /// Writes an epoch's sparse metric index.
    pub fn write_sparse_index(&mut self, index: &SparseMetricIndex) -> Result<(), FormatError> {
        self.footer.sm_start = self.w.stream_position()?;
        self.w.write_u32::<BigEndian>(index.per_metric.len() as u32)?;
        for (metric_id, node_ids) in &index.per_metric {
            self.w.write_u16::<BigEndian>(*metric_id)?;
            self.w.write_u32::<BigEndian>(node_ids.len() as u32)?;
            for node_id in node_ids {
                self.w.write_u32::<BigEndian>(*node_id)?;
            }
        }
        self.footer.sm_end = self.w.stream_position()?;
        self.pad_to_boundary()
    }

    /// Appends the footer and returns the underlying stream.
    pub fn finish(mut self) -> Result<W, FormatError> {
        let f = self.footer;
        for offset in [
            f.hdr_start,
            f.hdr_end,
            f.loadmap_start,
            f.loadmap_end,
            f.cct_start,
            f.cct_end,
            f.met_tbl_start,
            f.met_tbl_end,
            f.sm_start,
            f.sm_end,
        ] {
            self.w.write_u64::<BigEndian>(offset)?;
        }
        self.w.write_u64::<BigEndian>(FOOTER_MAGIC)?;
        self.w.flush()?;
        Ok(self.w)
    }

    fn pad_to_boundary(&mut self) -> Result<(), FormatError> {
        let pos = self.w.stream_position()?;
        let target = align_up(pos);
        if target != pos {
            // Seeking past EOF leaves holes unwritten on some targets, so
            // pad with explicit zero bytes.
            let zeros = [0u8; 256];
            let mut remaining = (target - pos) as usize;
            while remaining > 0 {
                let n = remaining.min(zeros.len());
                self.w.write_all(&zeros[..n])?;
                remaining -= n;
            }
        }
        Ok(())
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), FormatError> {
    w.write_u32::<BigEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{FOOTER_SIZE, SECTION_ALIGN};

    #[test]
    fn sections_start_on_boundaries() {
        let mut w = ProfileWriter::new(Cursor::new(Vec::new()));
        w.write_header(&[("program".into(), "a.out".into())])
            .unwrap();
        w.write_loadmap(&[LoadmapEntry {
            id: 1,
            name: "/usr/bin/a.out".into(),
            flags: 0,
        }])
        .unwrap();
        w.write_cct(
            [CctNodeRecord {
                node_id: 0,
                parent_id: 0,
                lm_id: u16::MAX,
                lm_offset: 0,
                metrics: vec![],
            }]
            .into_iter(),
        )
        .unwrap();
        w.write_metric_table(&[]).unwrap();
        w.write_identity_tuple(&IdentityTuple::default()).unwrap();
        w.write_sparse_index(&SparseMetricIndex::default()).unwrap();

        let footer = w.footer;
        assert_eq!(footer.hdr_start, 0);
        assert_eq!(footer.loadmap_start % SECTION_ALIGN, 0);
        assert_eq!(footer.cct_start % SECTION_ALIGN, 0);
        assert_eq!(footer.met_tbl_start % SECTION_ALIGN, 0);
        assert_eq!(footer.sm_start % SECTION_ALIGN, 0);
        assert!(footer.loadmap_end > footer.loadmap_start);

        let bytes = w.finish().unwrap().into_inner();
        assert_eq!(bytes.len() as u64 % SECTION_ALIGN, FOOTER_SIZE);
        let magic = u64::from_be_bytes(bytes[bytes.len() - 8..].try_into().unwrap());
        assert_eq!(magic, FOOTER_MAGIC);
    }

    #[test]
    fn cct_count_is_back_patched() {
        let mut w = ProfileWriter::new(Cursor::new(Vec::new()));
        w.write_header(&[]).unwrap();
        let nodes = (0..5u32).map(|i| CctNodeRecord {
            node_id: i,
            parent_id: i.saturating_sub(1),
            lm_id: 0,
            lm_offset: i as u64 * 16,
            metrics: vec![],
        });
        w.write_cct(nodes).unwrap();
        let start = w.footer.cct_start as usize;
        let bytes = w.finish().unwrap().into_inner();
        let count = u32::from_be_bytes(bytes[start..start + 4].try_into().unwrap());
        assert_eq!(count, 5);
    }
}
