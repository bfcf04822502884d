/// Parses `HH:MM:SS.mmm` or `HH:MM:SS,mmm` into seconds.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let t = raw.trim().replace(',', ".");
    let mut parts = t.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || h < 0.0 || m < 0.0 || s < 0.0 {
        return None;
    }
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Finds the last `<digits>%` in a line of process output.
pub fn parse_percent(line: &str) -> Option<u8> {
    let bytes = line.as_bytes();
    let mut found = None;
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'%' {
            continue;
        }
        let mut start = i;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start == i {
            continue;
        }
        if let Ok(v) = line[start..i].parse::<u32>() {
            found = Some(v.min(100) as u8);
        }
    }
    found
}
