//! Module parser
//!
//! A structural pass over the bytecode before it is handed to the engine.
//! It checks the header and section framing and records which sections are
//! present. Anything rejected here is a [`RuntimeError::ParseError`].
//!
//! Imports, exports and instruction typing are read by the engine once the
//! module compiles; its complaints surface as a load error.

use super::abi::{WASM_MAGIC, WASM_VERSION};
use super::error::{RuntimeError, RuntimeResult};

/// Highest known section id (data count)
const SECTION_MAX: u8 = 12;

/// Framing of one section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub id: u8,
    /// Body length in bytes
    pub size: usize,
}

/// Section layout of a module binary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub sections: Vec<Section>,
}

impl ModuleInfo {
    /// Check a module's header and section framing
    pub fn parse(bytes: &[u8]) -> RuntimeResult<Self> {
        if bytes.len() < 8 {
            return Err(parse_error("module too small"));
        }
        if bytes[0..4] != WASM_MAGIC {
            return Err(parse_error("invalid magic number"));
        }
        if bytes[4..8] != WASM_VERSION {
            return Err(parse_error("unsupported WASM version"));
        }

        let mut info = ModuleInfo::default();
        let mut reader = Reader::new(&bytes[8..]);

        while !reader.is_empty() {
            let id = reader.byte()?;
            let size = reader.leb128()? as usize;
            reader
                .take(size)
                .map_err(|_| parse_error("section extends past end of module"))?;

            if id > SECTION_MAX {
                return Err(parse_error(format!("unknown section id {id}")));
            }
            info.sections.push(Section { id, size });
        }

        Ok(info)
    }
}

fn parse_error(reason: impl Into<String>) -> RuntimeError {
    RuntimeError::ParseError(reason.into())
}

/// Bounds-checked cursor over a byte slice
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> RuntimeResult<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| parse_error("unexpected end of module"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> RuntimeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| parse_error("unexpected end of module"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Unsigned LEB128, at most 5 bytes
    fn leb128(&mut self) -> RuntimeResult<u32> {
        let mut result = 0u32;
        let mut shift = 0;

        for _ in 0..5 {
            let byte = self.byte()?;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }

        Err(parse_error("invalid LEB128"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

    fn leb(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut value = value;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    #[test]
    fn test_read_leb128() {
        assert_eq!(Reader::new(&[0x00]).leb128().unwrap(), 0);
        assert_eq!(Reader::new(&[0x7F]).leb128().unwrap(), 127);
        assert_eq!(Reader::new(&[0x80, 0x01]).leb128().unwrap(), 128);
        assert_eq!(Reader::new(&[0xE5, 0x8E, 0x26]).leb128().unwrap(), 624485);
        assert_eq!(Reader::new(&leb(300_000)).leb128().unwrap(), 300_000);
        assert!(Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x80]).leb128().is_err());
    }

    #[test]
    fn test_header_checks() {
        assert!(matches!(ModuleInfo::parse(b"\0as"), Err(RuntimeError::ParseError(_))));
        assert!(matches!(
            ModuleInfo::parse(b"garbage!"),
            Err(RuntimeError::ParseError(_))
        ));
        assert!(matches!(
            ModuleInfo::parse(&[0x00, 0x61, 0x73, 0x6D, 0x02, 0x00, 0x00, 0x00]),
            Err(RuntimeError::ParseError(_))
        ));

        let empty = ModuleInfo::parse(&HEADER).unwrap();
        assert!(empty.sections.is_empty());
    }

    #[test]
    fn test_truncated_section() {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(&[0x01, 0x10, 0x01]);
        assert_eq!(
            ModuleInfo::parse(&bytes),
            Err(RuntimeError::ParseError(
                "section extends past end of module".to_string()
            ))
        );
    }

    #[test]
    fn test_unknown_section_id() {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(&[0x20, 0x00]);
        assert_eq!(
            ModuleInfo::parse(&bytes),
            Err(RuntimeError::ParseError("unknown section id 32".to_string()))
        );
    }

    #[test]
    fn test_section_layout() {
        let wasm = wat::parse_str(
            r#"(module
                (import "env" "delay" (func (param i32)))
                (memory (export "memory") 1)
                (func (export "_start")))"#,
        )
        .unwrap();

        let info = ModuleInfo::parse(&wasm).unwrap();
        let ids: Vec<u8> = info
            .sections
            .iter()
            .map(|section| section.id)
            .filter(|&id| id != 0)
            .collect();
        // type, import, function, memory, export, code
        assert_eq!(ids, vec![1, 2, 3, 5, 7, 10]);
    }
}
