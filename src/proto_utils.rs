use hickory_proto::rr::Name;

/// flush 哨兵：线格式首标签以这些字节开头 / flush sentinel: leading bytes of the first wire label
pub const FLUSH_PREFIX: &[u8] = b"flush@";

/// Owner names starting with this label prefix are never served
/// forced-stale; they must be revalidated upstream.
pub const ESNI_PREFIX: &[u8] = b"_esni";

/// 将小写归一化的线格式域名写入 buf，返回写入的字节数 / Writes the lowercased wire-format qname into `buf`, returning the byte count
///
/// DNS names are case-insensitive, so `A.example` and `a.example` must
/// land on the same cache slot. Normalization only folds ASCII letters,
/// label by label; a 256-byte buffer always fits because the protocol
/// caps names at 255 octets. Returns `None` when the name would not fit.
pub fn write_normalized_qname(name: &Name, buf: &mut [u8]) -> Option<usize> {
    let mut pos = 0;
    for label in name.iter() {
        if pos + 1 + label.len() >= buf.len() {
            return None;
        }
        buf[pos] = label.len() as u8;
        pos += 1;
        for &b in label {
            buf[pos] = b.to_ascii_lowercase();
            pos += 1;
        }
    }
    if pos >= buf.len() {
        return None;
    }
    // root label terminates the wire form
    buf[pos] = 0;
    pos += 1;
    Some(pos)
}

/// Byte-prefix test on the first label. Matches the sentinel the way
/// the wire carries it, independent of any presentation escaping.
pub fn first_label_starts_with(name: &Name, prefix: &[u8]) -> bool {
    name.iter()
        .next()
        .map_or(false, |label| label.starts_with(prefix))
}

/// Rebuilds the owner name with the sentinel bytes removed from the
/// first label: `flush@example.com` becomes `example.com`.
pub fn strip_flush_prefix(name: &Name) -> Option<Name> {
    let mut labels = name.iter();
    let first = labels.next()?;
    let rest = first.strip_prefix(FLUSH_PREFIX)?;

    let mut parts: Vec<&[u8]> = Vec::with_capacity(name.num_labels() as usize);
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts.extend(labels);

    let mut stripped = Name::from_labels(parts).ok()?;
    stripped.set_fqdn(name.is_fqdn());
    Some(stripped)
}
