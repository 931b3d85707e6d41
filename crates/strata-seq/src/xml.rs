//! Sequence descriptor persistence
//!
//! Schema:
//!
//! ```xml
//! <sequence maxsamples="N" sampleformat="F" numsamples="M">
//!   <waveblock start="S">
//!     <!-- block-file child element emitted by the store -->
//!   </waveblock>
//! </sequence>
//! ```
//!
//! The writer clamps non-alias blocks reporting more than `maxsamples`
//! samples. The reader validates every attribute, and repairs rather than
//! rejects a damaged block list: missing block files become silence, stale
//! starts and totals are recomputed, and the damage is reported through
//! [`Sequence::error_opening`].

use std::sync::Arc;

use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;

use strata_core::{
    parse_nonneg_i64, SampleCount, SampleFormat, XmlWriter, MAX_BLOCK_SAMPLES, MIN_BLOCK_SAMPLES,
};
use strata_store::{BlockHandle, BlockStore};

use crate::{BlockRef, SeqError, SeqResult, Sequence};

impl Sequence {
    /// Emit this sequence's descriptor
    pub fn write_xml(&self, w: &mut XmlWriter) {
        w.start_tag("sequence");
        w.attr_u64("maxsamples", self.max_samples as u64);
        w.attr_u64("sampleformat", self.format.code() as u64);
        w.attr_i64("numsamples", self.num_samples);

        for block in &self.blocks {
            // An overlong non-alias block means an edit went wrong upstream;
            // clamp so the file stays loadable. Alias blocks keep their
            // media's length even when a format change shrank the bound.
            if !block.file.is_alias() && block.file.len() > self.max_samples {
                log::warn!(
                    "block file {} exceeds maximum {} samples; truncating",
                    block.file.display_name(),
                    self.max_samples
                );
                block.file.set_length(self.max_samples);
            }

            w.start_tag("waveblock");
            w.attr_i64("start", block.start);
            block.file.write_xml(w);
            w.end_tag("waveblock");
        }

        w.end_tag("sequence");
    }

    /// Serialised descriptor as a string
    pub fn to_xml(&self) -> String {
        let mut w = XmlWriter::new();
        self.write_xml(&mut w);
        w.finish()
    }

    /// Rebuild a sequence from its descriptor, resolving block-file child
    /// elements through `store`.
    pub fn read_xml(store: Arc<dyn BlockStore>, xml: &str) -> SeqResult<Sequence> {
        let mut reader = Reader::from_str(xml);

        let mut format = SampleFormat::default();
        let mut max_samples = strata_core::max_block_samples(format);
        let mut stated_total: SampleCount = 0;
        let mut seen_sequence = false;
        let mut error_opening = false;

        // (stated start, resolved file) per waveblock, file pending repair
        // when its child element failed to load
        let mut loading: Vec<(SampleCount, Option<BlockHandle>)> = Vec::new();
        let mut in_waveblock = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let mut attrs: Vec<(String, String)> = Vec::new();
                    for attr in e.attributes() {
                        let attr = attr.map_err(|err| SeqError::Xml(err.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr
                            .unescape_value()
                            .map_err(|err| SeqError::Xml(err.to_string()))?
                            .into_owned();
                        attrs.push((key, value));
                    }

                    match tag.as_str() {
                        "sequence" => {
                            seen_sequence = true;
                            for (name, value) in &attrs {
                                match name.as_str() {
                                    "maxsamples" => {
                                        let n = checked_attr(name, value)?;
                                        // A reasonable range; reject the
                                        // absurd rather than allocate for it
                                        if !(MIN_BLOCK_SAMPLES as i64..=MAX_BLOCK_SAMPLES as i64)
                                            .contains(&n)
                                        {
                                            return Err(SeqError::Xml(format!(
                                                "maxsamples {} out of range",
                                                n
                                            )));
                                        }
                                        max_samples = n as usize;
                                    }
                                    "sampleformat" => {
                                        let n = checked_attr(name, value)?;
                                        format =
                                            SampleFormat::from_code(n).ok_or_else(|| {
                                                SeqError::Xml(format!(
                                                    "unknown sampleformat {}",
                                                    n
                                                ))
                                            })?;
                                    }
                                    "numsamples" => {
                                        stated_total = checked_attr(name, value)?;
                                    }
                                    _ => {}
                                }
                            }
                        }
                        "waveblock" => {
                            in_waveblock = true;
                            let mut start: SampleCount = 0;
                            for (name, value) in &attrs {
                                if name == "start" {
                                    start = checked_attr(name, value)?;
                                }
                            }
                            loading.push((start, None));
                        }
                        _ if in_waveblock => {
                            match store.load_block_xml(&tag, &attrs) {
                                Ok(Some(file)) => {
                                    if let Some(last) = loading.last_mut() {
                                        last.1 = Some(file);
                                    }
                                }
                                Ok(None) => {
                                    // Not a block-file element; ignore
                                }
                                Err(err) => {
                                    log::warn!(
                                        "failed to load block file <{}>: {}",
                                        tag,
                                        err
                                    );
                                    error_opening = true;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"waveblock" {
                        in_waveblock = false;
                    }
                }
                Ok(Event::Eof) => break,
                Err(err) => return Err(SeqError::Xml(err.to_string())),
                Ok(_) => {}
            }
        }

        if !seen_sequence {
            return Err(SeqError::Xml("no <sequence> element".to_string()));
        }

        // Repair pass: every waveblock whose child failed to load becomes a
        // silent block of the length its neighbours' stated starts imply,
        // capped at maxsamples.
        let n = loading.len();
        let mut blocks: Vec<BlockRef> = Vec::with_capacity(n);
        for i in 0..n {
            let start = loading[i].0;
            let file = match loading[i].1.take() {
                Some(file) => file,
                None => {
                    let intended = if i + 1 < n {
                        loading[i + 1].0 - start
                    } else {
                        stated_total - start
                    };
                    if intended <= 0 {
                        log::warn!(
                            "gap in sequence descriptor at {} has no recoverable length; \
                             dropping block",
                            start
                        );
                        error_opening = true;
                        continue;
                    }
                    let mut len = intended as usize;
                    if len > max_samples {
                        // The oversize may be why the block failed to load;
                        // cap the stand-in
                        log::warn!(
                            "missing block file with length {} > maxsamples {}; \
                             setting length to maxsamples",
                            len,
                            max_samples
                        );
                        len = max_samples;
                    }
                    log::warn!(
                        "gap detected in sequence descriptor; replacing missing block \
                         file with silence"
                    );
                    error_opening = true;
                    store.new_silent_block(len)
                }
            };
            blocks.push(BlockRef::new(file, start));
        }

        let mut seq = Sequence {
            store,
            blocks,
            num_samples: stated_total,
            format,
            min_samples: max_samples / 2,
            max_samples,
            error_opening,
            od_mutex: Arc::new(Mutex::new(())),
        };
        seq.repair_after_load(stated_total);
        Ok(seq)
    }

    /// Recompute starts and the total after loading, logging every repair
    fn repair_after_load(&mut self, stated_total: SampleCount) {
        let mut running: SampleCount = 0;
        for block in &mut self.blocks {
            if block.start != running {
                log::warn!(
                    "gap in sequence descriptor: block {} starts at {}, expected {}; \
                     moving so blocks are contiguous",
                    block.file.display_name(),
                    block.start,
                    running
                );
                block.start = running;
                self.error_opening = true;
            }
            running += block.len() as SampleCount;
        }
        if stated_total != running {
            log::warn!(
                "correcting sequence sample count from {} to {}",
                stated_total,
                running
            );
            self.error_opening = true;
        }
        self.num_samples = running;
    }
}

fn checked_attr(name: &str, value: &str) -> SeqResult<i64> {
    parse_nonneg_i64(name, value).map_err(|err| SeqError::Xml(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::{DiskBlockStore, StoreConfig};
    use tempfile::tempdir;

    fn disk_store(dir: &std::path::Path) -> Arc<dyn BlockStore> {
        Arc::new(DiskBlockStore::open(StoreConfig::new(dir)).unwrap())
    }

    #[test]
    fn test_write_schema_shape() {
        let dir = tempdir().unwrap();
        let store = disk_store(dir.path());
        let mut seq = Sequence::with_max_samples(store, SampleFormat::Float, 2048);
        seq.append(&vec![0.5; 100]).unwrap();

        let xml = seq.to_xml();
        assert!(xml.contains("<sequence maxsamples=\"2048\" sampleformat=\"2\" numsamples=\"100\">"));
        assert!(xml.contains("<waveblock start=\"0\">"));
        assert!(xml.contains("<simpleblockfile"));
        assert!(xml.contains("</sequence>"));
    }

    #[test]
    fn test_roundtrip_preserves_contents() {
        let dir = tempdir().unwrap();
        let store = disk_store(dir.path());
        let mut seq = Sequence::with_max_samples(store.clone(), SampleFormat::Float, 1024);
        let data: Vec<f32> = (0..3000).map(|i| (i as f32 * 0.01).sin()).collect();
        seq.append(&data).unwrap();
        seq.insert_silence(1000, 500).unwrap();

        let xml = seq.to_xml();
        let loaded = Sequence::read_xml(store, &xml).unwrap();

        assert!(!loaded.error_opening());
        assert_eq!(loaded.num_samples(), seq.num_samples());
        assert_eq!(loaded.format(), seq.format());
        assert_eq!(
            loaded.get(0, 3500).unwrap(),
            seq.get(0, 3500).unwrap()
        );
        loaded.check_consistency().unwrap();
    }

    #[test]
    fn test_missing_block_file_repaired_with_silence() {
        let dir = tempdir().unwrap();
        let store = disk_store(dir.path());

        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<sequence maxsamples="1024" sampleformat="2" numsamples="600">
  <waveblock start="0">
    <silentblockfile len="300"/>
  </waveblock>
  <waveblock start="300">
    <simpleblockfile filename="b99999999.sb" len="300"/>
  </waveblock>
</sequence>
"#;
        let loaded = Sequence::read_xml(store, xml).unwrap();
        assert!(loaded.error_opening());
        assert_eq!(loaded.num_samples(), 600);
        assert_eq!(loaded.block_count(), 2);
        // The stand-in is silence of the intended length
        assert!(loaded.get(300, 300).unwrap().iter().all(|&v| v == 0.0));
        loaded.check_consistency().unwrap();
    }

    #[test]
    fn test_inconsistent_starts_recomputed() {
        let dir = tempdir().unwrap();
        let store = disk_store(dir.path());

        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<sequence maxsamples="1024" sampleformat="2" numsamples="999">
  <waveblock start="0">
    <silentblockfile len="100"/>
  </waveblock>
  <waveblock start="150">
    <silentblockfile len="100"/>
  </waveblock>
</sequence>
"#;
        let loaded = Sequence::read_xml(store, xml).unwrap();
        assert!(loaded.error_opening());
        // Starts made contiguous, total recomputed from block lengths
        assert_eq!(loaded.blocks()[1].start, 100);
        assert_eq!(loaded.num_samples(), 200);
        loaded.check_consistency().unwrap();
    }

    #[test]
    fn test_rejects_bad_attributes() {
        let dir = tempdir().unwrap();

        // maxsamples out of range
        let xml = r#"<sequence maxsamples="100" sampleformat="2" numsamples="0"></sequence>"#;
        assert!(Sequence::read_xml(disk_store(dir.path()), xml).is_err());

        // negative numsamples
        let xml = r#"<sequence maxsamples="2048" sampleformat="2" numsamples="-5"></sequence>"#;
        assert!(Sequence::read_xml(disk_store(dir.path()), xml).is_err());

        // unknown sample format
        let xml = r#"<sequence maxsamples="2048" sampleformat="9" numsamples="0"></sequence>"#;
        assert!(Sequence::read_xml(disk_store(dir.path()), xml).is_err());

        // no sequence element at all
        assert!(Sequence::read_xml(disk_store(dir.path()), "<other/>").is_err());
    }

    #[test]
    fn test_writer_clamps_overlong_non_alias_block() {
        let dir = tempdir().unwrap();
        let store = disk_store(dir.path());
        let mut seq = Sequence::with_max_samples(store.clone(), SampleFormat::Float, 2048);
        seq.append(&vec![0.25; 1000]).unwrap();

        // Sabotage: pretend the block grew past the bound
        seq.blocks[0].file.set_length(4096);
        seq.num_samples = 4096;

        let xml = seq.to_xml();
        // The writer clamped the reported length back to maxsamples
        assert!(xml.contains("len=\"2048\""));
        assert_eq!(seq.blocks[0].file.len(), 2048);
    }

    #[test]
    fn test_roundtrip_empty_sequence() {
        let dir = tempdir().unwrap();
        let store = disk_store(dir.path());
        let seq = Sequence::with_max_samples(store.clone(), SampleFormat::Int16, 4096);

        let loaded = Sequence::read_xml(store, &seq.to_xml()).unwrap();
        assert_eq!(loaded.num_samples(), 0);
        assert_eq!(loaded.format(), SampleFormat::Int16);
        assert_eq!(loaded.max_block_size(), 4096);
        assert!(!loaded.error_opening());
    }
}
