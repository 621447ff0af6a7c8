//! DfuSe container format (C9): "DfuSe" prefix, one or more named targets,
//! each made of one or more address+size elements. Grounded in
//! `dfuse_do_dfuse_dnload`'s prefix/target/element framing, but parses the
//! whole container up front into owned structures instead of streaming
//! straight into device writes.

use byteorder::{ByteOrder, LE};

use crate::error::Error;

/// One contiguous memory element inside a target.
#[derive(Debug, Clone)]
pub struct Element {
    pub address: u32,
    pub data: Vec<u8>,
}

/// One DFU image, addressed to a specific alt-setting.
#[derive(Debug, Clone)]
pub struct Target {
    pub alt_setting: u8,
    pub name: Option<String>,
    pub elements: Vec<Element>,
}

/// A fully parsed DfuSe container (everything between the file's plain-DFU
/// prefix, if any, and its plain-DFU suffix).
#[derive(Debug, Clone)]
pub struct DfuseFile {
    pub targets: Vec<Target>,
}

const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";
const TARGET_PREFIX_LEN: usize = 274;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.data.len() {
            return Err(Error::Data(format!(
                "corrupt DfuSe file: cannot read {n} bytes from {} remaining",
                self.data.len() - self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

/// Parses the body of a DfuSe container (the bytes between the plain-DFU
/// prefix and suffix, i.e. with the 16-byte suffix already stripped by
/// [`crate::suffix::parse`]). Mirrors `dfuse_do_dfuse_dnload`'s framing.
pub fn parse(body: &[u8]) -> Result<DfuseFile, Error> {
    let mut cur = Cursor { data: body, pos: 0 };

    let prefix = cur.take(11)?;
    if &prefix[0..5] != DFUSE_SIGNATURE {
        return Err(Error::Data("no valid DfuSe signature".into()));
    }
    if prefix[5] != 0x01 {
        return Err(Error::Data(format!(
            "DFU format revision {} not supported",
            prefix[5]
        )));
    }
    let num_targets = prefix[10];

    let mut targets = Vec::with_capacity(num_targets as usize);
    for _ in 0..num_targets {
        let target_prefix = cur.take(TARGET_PREFIX_LEN)?;
        if &target_prefix[0..6] != TARGET_SIGNATURE {
            return Err(Error::Data("no valid target signature".into()));
        }
        let alt_setting = target_prefix[6];
        let has_name = target_prefix[7] != 0;
        let name = if has_name {
            let raw = &target_prefix[11..266];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Some(String::from_utf8_lossy(&raw[..end]).into_owned())
        } else {
            None
        };
        let num_elements = LE::read_u32(&target_prefix[270..274]);

        let mut elements = Vec::with_capacity(num_elements as usize);
        for _ in 0..num_elements {
            let header = cur.take(8)?;
            let address = LE::read_u32(&header[0..4]);
            let size = LE::read_u32(&header[4..8]) as usize;
            let data = cur.take(size)?.to_vec();
            elements.push(Element { address, data });
        }

        targets.push(Target {
            alt_setting,
            name,
            elements,
        });
    }

    if cur.pos != body.len() {
        log::warn!("{} bytes leftover after parsing DfuSe file", body.len() - cur.pos);
    }

    Ok(DfuseFile { targets })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_container(targets: &[(u8, Option<&str>, &[(u32, &[u8])])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(DFUSE_SIGNATURE);
        out.push(0x01);
        out.extend_from_slice(&[0u8; 4]); // total size placeholder, unused by parser
        out.push(targets.len() as u8);

        for (alt, name, elements) in targets {
            let mut tp = vec![0u8; TARGET_PREFIX_LEN];
            tp[0..6].copy_from_slice(TARGET_SIGNATURE);
            tp[6] = *alt;
            if let Some(n) = name {
                tp[7] = 1;
                tp[11..11 + n.len()].copy_from_slice(n.as_bytes());
            }
            LE::write_u32(&mut tp[266..270], elements.iter().map(|(_, d)| 8 + d.len() as u32).sum());
            LE::write_u32(&mut tp[270..274], elements.len() as u32);
            out.extend_from_slice(&tp);

            for (addr, data) in *elements {
                let mut header = [0u8; 8];
                LE::write_u32(&mut header[0..4], *addr);
                LE::write_u32(&mut header[4..8], data.len() as u32);
                out.extend_from_slice(&header);
                out.extend_from_slice(data);
            }
        }
        out
    }

    #[test]
    fn parses_single_target_single_element() {
        let body = build_container(&[(0, Some("ROM"), &[(0x0800_0000, &[1, 2, 3, 4])])]);
        let file = parse(&body).unwrap();
        assert_eq!(file.targets.len(), 1);
        assert_eq!(file.targets[0].alt_setting, 0);
        assert_eq!(file.targets[0].name.as_deref(), Some("ROM"));
        assert_eq!(file.targets[0].elements[0].address, 0x0800_0000);
        assert_eq!(file.targets[0].elements[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut body = build_container(&[(0, None, &[(0, &[1])])]);
        body[0] = b'X';
        assert!(parse(&body).is_err());
    }

    #[test]
    fn rejects_truncated_element_data() {
        let mut body = build_container(&[(0, None, &[(0, &[1, 2, 3, 4])])]);
        body.truncate(body.len() - 2);
        assert!(parse(&body).is_err());
    }

    #[test]
    fn multi_target_file_parses_each_in_order() {
        let body = build_container(&[
            (0, None, &[(0x0800_0000, &[1, 2])]),
            (1, None, &[(0x0801_0000, &[3, 4, 5])]),
        ]);
        let file = parse(&body).unwrap();
        assert_eq!(file.targets.len(), 2);
        assert_eq!(file.targets[1].alt_setting, 1);
        assert_eq!(file.targets[1].elements[0].data, vec![3, 4, 5]);
    }
}
