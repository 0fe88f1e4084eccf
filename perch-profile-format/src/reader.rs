//! Footer-driven reader for profile files.
//!
//! `ProfileReader` validates the trailing footer and exposes one accessor
//! per section. The footer indexes a single epoch's sections; files that
//! hold several epochs (written after mid-run load-map changes) are walked
//! sequentially with [`ProfileReader::epochs`], which relies on every
//! section being self-delimiting and boundary-aligned.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};

use crate::{
    align_up, CctNodeRecord, Footer, FormatError, IdentityTuple, LoadmapEntry, MetricTableEntry,
    SparseMetricIndex, FOOTER_MAGIC, FOOTER_SIZE,
};

/// Sanity bound for on-disk string lengths.
const MAX_STRING_LEN: u32 = 1 << 24;

/// All sections of one epoch, in parse order.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSections {
    pub loadmap: Vec<LoadmapEntry>,
    pub cct: Vec<CctNodeRecord>,
    pub metric_table: Vec<MetricTableEntry>,
    pub identity_tuple: IdentityTuple,
    pub sparse_index: SparseMetricIndex,
}

pub struct ProfileReader<R: Read + Seek> {
    r: R,
    footer: Footer,
    footer_pos: u64,
}

impl<R: Read + Seek> ProfileReader<R> {
    pub fn new(mut r: R) -> Result<Self, FormatError> {
        let len = r.seek(SeekFrom::End(0))?;
        if len < FOOTER_SIZE {
            return Err(FormatError::TooShort { len });
        }
        let footer_pos = len - FOOTER_SIZE;
        r.seek(SeekFrom::Start(footer_pos))?;
        let mut fields = [0u64; 11];
        for field in fields.iter_mut() {
            *field = r.read_u64::<BigEndian>()?;
        }
        if fields[10] != FOOTER_MAGIC {
            return Err(FormatError::BadMagic { found: fields[10] });
        }
        let footer = Footer {
            hdr_start: fields[0],
            hdr_end: fields[1],
            loadmap_start: fields[2],
            loadmap_end: fields[3],
            cct_start: fields[4],
            cct_end: fields[5],
            met_tbl_start: fields[6],
            met_tbl_end: fields[7],
            sm_start: fields[8],
            sm_end: fields[9],
        };
        for (start, end) in [
            (footer.hdr_start, footer.hdr_end),
            (footer.loadmap_start, footer.loadmap_end),
            (footer.cct_start, footer.cct_end),
            (footer.met_tbl_start, footer.met_tbl_end),
            (footer.sm_start, footer.sm_end),
        ] {
            if start > end || end > footer_pos {
                return Err(FormatError::BadSectionRange { start, end });
            }
        }
        Ok(Self {
            r,
            footer,
            footer_pos,
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn header(&mut self) -> Result<Vec<(String, String)>, FormatError> {
        self.r.seek(SeekFrom::Start(self.footer.hdr_start))?;
        let count = self.r.read_u32::<BigEndian>()?;
        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_string(&mut self.r)?;
            let value = read_string(&mut self.r)?;
            pairs.push((name, value));
        }
        Ok(pairs)
    }

    /// The load map of the footer-indexed epoch.
    pub fn loadmap(&mut self) -> Result<Vec<LoadmapEntry>, FormatError> {
        self.r.seek(SeekFrom::Start(self.footer.loadmap_start))?;
        read_loadmap(&mut self.r)
    }

    /// The calling-context tree of the footer-indexed epoch.
    ///
    /// Verifies the pre-order invariant: every node's parent appears
    /// before the node itself.
    pub fn cct(&mut self) -> Result<Vec<CctNodeRecord>, FormatError> {
        self.r.seek(SeekFrom::Start(self.footer.cct_start))?;
        read_cct(&mut self.r)
    }

    pub fn metric_table(&mut self) -> Result<Vec<MetricTableEntry>, FormatError> {
        self.r.seek(SeekFrom::Start(self.footer.met_tbl_start))?;
        read_metric_table(&mut self.r)
    }

    /// The identity tuple, located at the boundary after the metric table.
    pub fn identity_tuple(&mut self) -> Result<IdentityTuple, FormatError> {
        self.r
            .seek(SeekFrom::Start(align_up(self.footer.met_tbl_end)))?;
        read_identity_tuple(&mut self.r)
    }

    pub fn sparse_index(&mut self) -> Result<SparseMetricIndex, FormatError> {
        self.r.seek(SeekFrom::Start(self.footer.sm_start))?;
        read_sparse_index(&mut self.r)
    }

    /// Walks every epoch in file order (newest first) by sequential scan.
    pub fn epochs(&mut self) -> Result<Vec<EpochSections>, FormatError> {
        let mut epochs = Vec::new();
        let mut pos = align_up(self.footer.hdr_end);
        while pos < self.footer_pos {
            self.r.seek(SeekFrom::Start(pos))?;
            let loadmap = read_loadmap(&mut self.r)?;
            self.seek_to_next_boundary()?;
            let cct = read_cct(&mut self.r)?;
            self.seek_to_next_boundary()?;
            let metric_table = read_metric_table(&mut self.r)?;
            self.seek_to_next_boundary()?;
            let identity_tuple = read_identity_tuple(&mut self.r)?;
            self.seek_to_next_boundary()?;
            let sparse_index = read_sparse_index(&mut self.r)?;
            pos = align_up(self.r.stream_position()?);
            epochs.push(EpochSections {
                loadmap,
                cct,
                metric_table,
                identity_tuple,
                sparse_index,
            });
        }
        Ok(epochs)
    }

    fn seek_to_next_boundary(&mut self) -> Result<(), FormatError> {
        let pos = self.r.stream_position()?;
        self.r.seek(SeekFrom::Start(align_up(pos)))?;
        Ok(())
    }
}

fn read_loadmap<R: Read>(r: &mut R) -> Result<Vec<LoadmapEntry>, FormatError> {
    let count = r.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.read_u16::<BigEndian>()?;
        let name = read_string(r)?;
        let flags = r.read_u32::<BigEndian>()?;
        entries.push(LoadmapEntry { id, name, flags });
    }
    Ok(entries)
}

fn read_cct<R: Read>(r: &mut R) -> Result<Vec<CctNodeRecord>, FormatError> {
    let count = r.read_u32::<BigEndian>()?;
    let mut nodes = Vec::with_capacity(count as usize);
    for i in 0..count {
        let node_id = r.read_u32::<BigEndian>()?;
        let parent_id = r.read_u32::<BigEndian>()?;
        let lm_id = r.read_u16::<BigEndian>()?;
        let lm_offset = r.read_u64::<BigEndian>()?;
        let metric_count = r.read_u16::<BigEndian>()?;
        let mut metrics = Vec::with_capacity(metric_count as usize);
        for _ in 0..metric_count {
            let metric_id = r.read_u16::<BigEndian>()?;
            let value = r.read_f64::<BigEndian>()?;
            metrics.push((metric_id, value));
        }
        if i > 0 && parent_id >= node_id {
            return Err(FormatError::OrphanNode { node_id, parent_id });
        }
        nodes.push(CctNodeRecord {
            node_id,
            parent_id,
            lm_id,
            lm_offset,
            metrics,
        });
    }
    Ok(nodes)
}

fn read_metric_table<R: Read>(r: &mut R) -> Result<Vec<MetricTableEntry>, FormatError> {
    let count = r.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_string(r)?;
        let unit = read_string(r)?;
        let flags = r.read_u32::<BigEndian>()?;
        let period = r.read_u64::<BigEndian>()?;
        entries.push(MetricTableEntry {
            name,
            unit,
            flags,
            period,
        });
    }
    Ok(entries)
}

fn read_identity_tuple<R: Read>(r: &mut R) -> Result<IdentityTuple, FormatError> {
    let dict_count = r.read_u32::<BigEndian>()?;
    let mut dictionary = Vec::with_capacity(dict_count as usize);
    for _ in 0..dict_count {
        let kind = r.read_u16::<BigEndian>()?;
        let label = read_string(r)?;
        dictionary.push((kind, label));
    }
    let tuple_count = r.read_u16::<BigEndian>()?;
    let mut tuple = Vec::with_capacity(tuple_count as usize);
    for _ in 0..tuple_count {
        let kind = r.read_u16::<BigEndian>()?;
        let value = r.read_u64::<BigEndian>()?;
        tuple.push((kind, value));
    }
    Ok(IdentityTuple { dictionary, tuple })
}

fn read_sparse_index<R: Read>(r: &mut R) -> Result<SparseMetricIndex, FormatError> {
    let metric_count = r.read_u32::<BigEndian>()?;
    let mut per_metric = Vec::with_capacity(metric_count as usize);
    for _ in 0..metric_count {
        let metric_id = r.read_u16::<BigEndian>()?;
        let node_count = r.read_u32::<BigEndian>()?;
        let mut node_ids = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            node_ids.push(r.read_u32::<BigEndian>()?);
        }
        per_metric.push((metric_id, node_ids));
    }
    Ok(SparseMetricIndex { per_metric })
}

fn read_string<R: Read>(r: &mut R) -> Result<String, FormatError> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_STRING_LEN {
        return Err(FormatError::StringTooLong { len });
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::writer::ProfileWriter;

    fn sample_nodes() -> Vec<CctNodeRecord> {
        vec![
            CctNodeRecord {
                node_id: 0,
                parent_id: 0,
                lm_id: u16::MAX,
                lm_offset: 0,
                metrics: vec![],
            },
            CctNodeRecord {
                node_id: 1,
                parent_id: 0,
                lm_id: 1,
                lm_offset: 0x1234,
                metrics: vec![],
            },
            CctNodeRecord {
                node_id: 2,
                parent_id: 1,
                lm_id: 1,
                lm_offset: 0x1280,
                metrics: vec![(0, 10.0)],
            },
        ]
    }

    fn write_epoch(w: &mut ProfileWriter<Cursor<Vec<u8>>>, nodes: &[CctNodeRecord]) {
        w.write_loadmap(&[LoadmapEntry {
            id: 1,
            name: "/usr/bin/app".into(),
            flags: 1,
        }])
        .unwrap();
        w.write_cct(nodes.iter().cloned()).unwrap();
        w.write_metric_table(&[MetricTableEntry {
            name: "CPUTIME".into(),
            unit: "us".into(),
            flags: 0,
            period: 1000,
        }])
        .unwrap();
        w.write_identity_tuple(&IdentityTuple {
            dictionary: vec![(crate::idtuple::KIND_THREAD, "thread".into())],
            tuple: vec![(crate::idtuple::KIND_THREAD, 0)],
        })
        .unwrap();
        w.write_sparse_index(&SparseMetricIndex {
            per_metric: vec![(0, vec![2])],
        })
        .unwrap();
    }

    #[test]
    fn round_trip_single_epoch() {
        let mut w = ProfileWriter::new(Cursor::new(Vec::new()));
        w.write_header(&[
            ("program".into(), "app".into()),
            ("pid".into(), "4242".into()),
        ])
        .unwrap();
        let nodes = sample_nodes();
        write_epoch(&mut w, &nodes);
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ProfileReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(
            r.header().unwrap(),
            vec![
                ("program".to_string(), "app".to_string()),
                ("pid".to_string(), "4242".to_string()),
            ]
        );
        assert_eq!(r.loadmap().unwrap().len(), 1);
        assert_eq!(r.cct().unwrap(), nodes);
        assert_eq!(r.metric_table().unwrap()[0].name, "CPUTIME");
        assert_eq!(r.identity_tuple().unwrap().tuple, vec![(3, 0)]);
        assert_eq!(r.sparse_index().unwrap().per_metric, vec![(0, vec![2])]);
    }

    #[test]
    fn sequential_scan_sees_every_epoch() {
        let mut w = ProfileWriter::new(Cursor::new(Vec::new()));
        w.write_header(&[]).unwrap();
        let nodes = sample_nodes();
        write_epoch(&mut w, &nodes); // newest epoch
        write_epoch(&mut w, &nodes[..2].to_vec()); // older epoch
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ProfileReader::new(Cursor::new(bytes)).unwrap();
        let epochs = r.epochs().unwrap();
        assert_eq!(epochs.len(), 2);
        assert_eq!(epochs[0].cct.len(), 3);
        assert_eq!(epochs[1].cct.len(), 2);
        // The footer indexes the last epoch written.
        assert_eq!(r.cct().unwrap().len(), 2);
    }

    #[test]
    fn truncated_file_is_rejected() {
        assert!(matches!(
            ProfileReader::new(Cursor::new(vec![0u8; 16])),
            Err(FormatError::TooShort { .. })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = vec![0u8; 256];
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&0xdead_beefu64.to_be_bytes());
        assert!(matches!(
            ProfileReader::new(Cursor::new(bytes)),
            Err(FormatError::BadMagic { .. })
        ));
    }
}
