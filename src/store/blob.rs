//! Record format - the unit written to the object store file

/// How a record's payload is stored on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordEncoding {
    /// Stored as-is
    Raw,
    /// zstd-compressed
    Zstd,
}

impl RecordEncoding {
    pub fn as_byte(&self) -> u8 {
        match self {
            RecordEncoding::Raw => 0,
            RecordEncoding::Zstd => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordEncoding::Raw),
            1 => Some(RecordEncoding::Zstd),
            _ => None,
        }
    }
}

/// A stored node encoding plus the on-disk encoding tag
#[derive(Clone, Debug)]
pub struct Record {
    pub encoding: RecordEncoding,
    /// Raw data (uncompressed)
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(encoding: RecordEncoding, data: Vec<u8>) -> Self {
        Record { encoding, data }
    }

    /// Pick the encoding for a payload. Compression only pays off once the
    /// payload is larger than a zstd frame header.
    pub fn for_payload(data: Vec<u8>, compression_level: Option<i32>) -> (Self, i32) {
        match compression_level {
            Some(level) if data.len() >= 128 => (Record::new(RecordEncoding::Zstd, data), level),
            _ => (Record::new(RecordEncoding::Raw, data), 0),
        }
    }

    /// Serialize for storage: tag byte followed by the (possibly compressed)
    /// payload
    pub fn pack(&self, level: i32) -> crate::Result<Vec<u8>> {
        let mut output = vec![self.encoding.as_byte()];
        match self.encoding {
            RecordEncoding::Raw => output.extend_from_slice(&self.data),
            RecordEncoding::Zstd => output.extend(zstd::encode_all(self.data.as_slice(), level)?),
        }
        Ok(output)
    }

    /// Read a record back from storage
    pub fn unpack(data: &[u8]) -> crate::Result<Self> {
        let (&tag, payload) = data
            .split_first()
            .ok_or_else(|| crate::Error::Corruption("Empty record data".into()))?;

        let encoding = RecordEncoding::from_byte(tag)
            .ok_or_else(|| crate::Error::Corruption(format!("Invalid record encoding: {}", tag)))?;

        let data = match encoding {
            RecordEncoding::Raw => payload.to_vec(),
            RecordEncoding::Zstd => zstd::decode_all(payload)?,
        };

        Ok(Record { encoding, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let payload = vec![42u8; 512];
        let (record, level) = Record::for_payload(payload.clone(), Some(3));
        assert_eq!(record.encoding, RecordEncoding::Zstd);

        let packed = record.pack(level).unwrap();
        assert!(packed.len() < payload.len());

        let restored = Record::unpack(&packed).unwrap();
        assert_eq!(restored.data, payload);
        assert_eq!(restored.encoding, RecordEncoding::Zstd);
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let (record, level) = Record::for_payload(b"leaf".to_vec(), Some(3));
        assert_eq!(record.encoding, RecordEncoding::Raw);
        let packed = record.pack(level).unwrap();
        assert_eq!(&packed[1..], b"leaf");
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(Record::unpack(&[]).is_err());
        assert!(Record::unpack(&[9, 1, 2, 3]).is_err());
    }
}
