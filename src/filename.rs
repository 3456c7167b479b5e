//! Block filename generation from `.idx` templates
//!
//! Versions 1-4 substitute the first block of the file into a single
//! printf-style placeholder. Versions 5-6 expand `%0Nx` hex groups right to
//! left, each consuming `4*N` low bits of the address, and recycle the
//! leftmost group as nested directories while address bits remain.

use crate::error::{IdxError, Result};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// A parsed `%[0][width]conv` placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IntSpec {
    zero_pad: bool,
    width: usize,
    conv: u8,
    /// Length of the placeholder in the template
    len: usize,
}

fn parse_int_spec(s: &[u8]) -> Option<IntSpec> {
    if s.first() != Some(&b'%') {
        return None;
    }
    let mut i = 1;
    let zero_pad = s.get(i) == Some(&b'0');
    if zero_pad {
        i += 1;
    }
    let mut width = 0usize;
    while let Some(c) = s.get(i).filter(|c| c.is_ascii_digit()) {
        width = width * 10 + (c - b'0') as usize;
        i += 1;
    }
    match s.get(i) {
        Some(&conv) if matches!(conv, b'd' | b'i' | b'u' | b'x' | b'X') => Some(IntSpec {
            zero_pad,
            width,
            conv,
            len: i + 1,
        }),
        _ => None,
    }
}

fn format_int(spec: &IntSpec, value: i64) -> String {
    let body = match spec.conv {
        b'x' => format!("{:x}", value),
        b'X' => format!("{:X}", value),
        _ => value.to_string(),
    };
    if body.len() >= spec.width {
        body
    } else if spec.zero_pad {
        let (sign, digits) = match body.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", body.as_str()),
        };
        format!("{}{}{}", sign, "0".repeat(spec.width - body.len()), digits)
    } else {
        format!("{}{}", " ".repeat(spec.width - body.len()), body)
    }
}

/// Substitute `value` into the first placeholder of `template`
fn sprintf_int(template: &str, value: i64) -> Result<String> {
    let Some(n) = template.find('%') else {
        return Ok(template.to_string());
    };
    let spec = parse_int_spec(&template.as_bytes()[n..]).ok_or_else(|| {
        IdxError::Configuration(format!("malformed placeholder in template '{}'", template))
    })?;
    Ok(format!(
        "{}{}{}",
        &template[..n],
        format_int(&spec, value),
        &template[n + spec.len..]
    ))
}

/// Digit count of a `%0Nx` group starting at `c`
fn hex_group_digits(template: &[u8], c: usize) -> Option<u32> {
    match (template.get(c + 1), template.get(c + 2), template.get(c + 3)) {
        (Some(b'0'), Some(d), Some(b'x')) if (b'1'..=b'9').contains(d) => Some((d - b'0') as u32),
        _ => None,
    }
}

/// Reject templates whose placeholders cannot be expanded
pub fn validate_template(template: &str, version: u32) -> Result<()> {
    let bytes = template.as_bytes();
    let bad = |c: usize| {
        IdxError::Configuration(format!(
            "malformed filename template '{}' at position {}",
            template, c
        ))
    };
    for (c, _) in template.match_indices('%') {
        if version >= 5 {
            hex_group_digits(bytes, c).ok_or_else(|| bad(c))?;
        } else {
            parse_int_spec(&bytes[c..]).ok_or_else(|| bad(c))?;
        }
    }
    if version < 5 && template.matches('%').count() > 1 {
        return Err(IdxError::Configuration(format!(
            "filename template '{}' has more than one placeholder",
            template
        )));
    }
    Ok(())
}

/// Validate a time template (`time%04d/` style)
pub fn validate_time_template(template: &str) -> Result<()> {
    sprintf_int(template, 0).map(|_| ())
}

/// Legacy generator. `first_block` is the first block stored in the file.
pub fn filename_v1234(
    filename_template: &str,
    time_template: &str,
    time: f64,
    first_block: i64,
) -> Result<String> {
    let Some(n) = filename_template.find('%') else {
        return Ok(filename_template.to_string());
    };
    if time_template.is_empty() {
        return sprintf_int(filename_template, first_block);
    }
    Ok(format!(
        "{}{}{}",
        &filename_template[..n],
        sprintf_int(time_template, time as i64)?,
        sprintf_int(&filename_template[n..], first_block)?
    ))
}

/// Current generator. A negative address yields an empty filename.
pub fn filename_v56(
    filename_template: &str,
    time_template: &str,
    time: f64,
    first_block: i64,
) -> Result<String> {
    let tpl = filename_template.as_bytes();
    if !filename_template.contains('%') {
        return Ok(filename_template.to_string());
    }
    if first_block < 0 {
        return Ok(String::new());
    }

    let mut address = first_block as u64;
    // built reversed, then flipped
    let mut out: Vec<u8> = Vec::with_capacity(tpl.len() + 32);
    // end of the unconsumed template prefix (exclusive)
    let mut s = tpl.len();
    let mut last_group = None;

    for c in (0..tpl.len()).rev() {
        if tpl[c] != b'%' || c >= s {
            continue;
        }
        let digits = hex_group_digits(tpl, c).ok_or_else(|| {
            IdxError::Configuration(format!("malformed filename template '{}'", filename_template))
        })?;
        last_group = Some(digits);

        out.extend(tpl[(c + 4).min(s)..s].iter().rev());
        push_hex(&mut out, &mut address, digits);
        s = c;
    }

    if let Some(digits) = last_group {
        while address != 0 {
            out.push(b'/');
            push_hex(&mut out, &mut address, digits);
        }
    }

    if !time_template.is_empty() {
        let t = sprintf_int(time_template, time as i64)?;
        out.extend(t.bytes().rev());
    }

    out.extend(tpl[..s].iter().rev());
    out.reverse();
    String::from_utf8(out).map_err(|e| IdxError::Configuration(e.to_string()))
}

fn push_hex(out: &mut Vec<u8>, address: &mut u64, digits: u32) {
    let numbits = digits * 4;
    let mut partial = if numbits >= 64 {
        *address
    } else {
        *address & ((1u64 << numbits) - 1)
    };
    for _ in 0..digits {
        out.push(HEX_DIGITS[(partial & 0xf) as usize]);
        partial >>= 4;
    }
    *address = if numbits >= 64 { 0 } else { *address >> numbits };
}

/// Recover the first-block address from a name made by [`filename_v56`]
pub fn address_from_filename(
    filename_template: &str,
    time_template: &str,
    time: f64,
    filename: &str,
) -> Option<u64> {
    let tpl = filename_template.as_bytes();
    let name = filename.as_bytes();
    let mut pos = name.len();
    let mut s = tpl.len();
    let mut shift = 0u32;
    let mut address = 0u64;
    let mut last_group = None;

    for c in (0..tpl.len()).rev() {
        if tpl[c] != b'%' || c >= s {
            continue;
        }
        let digits = hex_group_digits(tpl, c)?;
        last_group = Some(digits);

        let literal = &tpl[(c + 4).min(s)..s];
        if !name[..pos].ends_with(literal) {
            return None;
        }
        pos -= literal.len();
        let start = pos.checked_sub(digits as usize)?;
        let value = u64::from_str_radix(std::str::from_utf8(&name[start..pos]).ok()?, 16).ok()?;
        address |= value << shift;
        shift += digits * 4;
        pos = start;
        s = c;
    }

    let mut rest = &name[..pos];
    rest = rest.strip_prefix(&tpl[..s])?;
    if !time_template.is_empty() {
        let t = sprintf_int(time_template, time as i64).ok()?;
        rest = rest.strip_prefix(t.as_bytes())?;
    }

    if !rest.is_empty() {
        let digits = last_group?;
        let rest = std::str::from_utf8(rest).ok()?;
        for group in rest.split('/').filter(|g| !g.is_empty()).rev() {
            if group.len() != digits as usize {
                return None;
            }
            address |= u64::from_str_radix(group, 16).ok()? << shift;
            shift += digits * 4;
        }
    }
    Some(address)
}

/// Default template for a dataset at `url`: `./<basename>/%02x/.../%04x.bin`
pub fn guess_filename_template(url: &str, max_resolution: u32, bitsperblock: u32) -> String {
    let mut nbits_blocknumber = max_resolution as i64 - bitsperblock as i64;

    let path = url.strip_prefix("file://").unwrap_or(url);
    let basename = if url.contains("://") && !url.starts_with("file://") {
        String::new()
    } else {
        std::path::Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    };
    let basename = if basename.is_empty() {
        "visus_data".to_string()
    } else {
        basename
    };

    let mut out = format!("./{}", basename);
    while nbits_blocknumber > 16 {
        out.push_str("/%02x");
        nbits_blocknumber -= 8;
    }
    out.push_str("/%04x.bin");
    out
}

/// Parts of `scheme://host:port/path` used by alias substitution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParts {
    pub protocol: String,
    pub hostname: String,
    pub port: String,
    pub path: String,
}

impl UrlParts {
    pub fn parse(url: &str) -> Self {
        let Some((protocol, rest)) = url.split_once("://") else {
            return Self {
                protocol: "file".to_string(),
                path: url.to_string(),
                ..Default::default()
            };
        };
        if protocol == "file" {
            return Self {
                protocol: protocol.to_string(),
                path: rest.to_string(),
                ..Default::default()
            };
        }
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (hostname, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, p),
            None => (authority, ""),
        };
        Self {
            protocol: protocol.to_string(),
            hostname: hostname.to_string(),
            port: port.to_string(),
            path: path.to_string(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.protocol == "file"
    }

    /// Parent directory of the path
    pub fn directory(&self) -> String {
        std::path::Path::new(&self.path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Resolve `./`, `$(CurrentFileDirectory)`, `$(protocol)`, `$(hostname)` and
/// `$(port)` against the URL of the descriptor that contains `value`
pub fn resolve_aliases(value: &str, url: &str) -> String {
    let parts = UrlParts::parse(url);
    let dir = parts.directory();
    let mut value = value.to_string();

    if !dir.is_empty() {
        if let Some(rest) = value.strip_prefix("./") {
            value = format!("{}/{}", dir, rest);
        }
        value = value.replace("$(CurrentFileDirectory)", &dir);
    }

    value
        .replace("$(protocol)", &parts.protocol)
        .replace("$(hostname)", &parts.hostname)
        .replace("$(port)", &parts.port)
}
