//! domain name walking and unlikely-label generation

use rand::Rng;

/// Longest name, in presentation format, that fits in a DNS message.
pub const MAX_DNS_NAME_LEN: usize = 253;

/// Longest single label.
pub const MAX_DNS_LABEL_LEN: usize = 63;

/// Bounds for generated wildcard-probe labels.
pub const MIN_LABEL_LEN: usize = 6;
pub const MAX_LABEL_LEN: usize = 24;

const LDH_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-";

/// Strip a single trailing dot, if present.
pub fn remove_last_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Lowercase a name and strip its trailing dot.
pub fn normalize(name: &str) -> String {
    remove_last_dot(name).to_ascii_lowercase()
}

/// Append the root label if `name` does not already carry one.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

pub fn num_labels(name: &str) -> usize {
    let name = remove_last_dot(name);
    if name.is_empty() {
        0
    } else {
        name.split('.').count()
    }
}

/// Walk the label suffixes of `fqdn` from the full name down to
/// `registered`, invoking `cb` on each. The walk stops early when `cb`
/// returns true.
pub fn fqdn_to_registered<F>(fqdn: &str, registered: &str, mut cb: F)
where
    F: FnMut(&str) -> bool,
{
    let fqdn = normalize(fqdn);
    let registered = normalize(registered);

    let mut name = fqdn.as_str();
    loop {
        if cb(name) || name == registered {
            return;
        }
        match name.split_once('.') {
            Some((_, rest)) => name = rest,
            None => return,
        }
    }
}

/// The reverse of [`fqdn_to_registered`]: walk from `registered` up to the
/// full name, one label at a time.
pub fn registered_to_fqdn<F>(registered: &str, fqdn: &str, mut cb: F)
where
    F: FnMut(&str) -> bool,
{
    let mut subs: Vec<String> = Vec::new();
    fqdn_to_registered(fqdn, registered, |sub| {
        subs.push(sub.to_string());
        false
    });

    for sub in subs.iter().rev() {
        if cb(sub) {
            return;
        }
    }
}

/// Generate a random label under `sub` that is very unlikely to exist.
///
/// The label is lowercase LDH with no leading or trailing hyphen and a
/// length drawn uniformly from the allowed range. Returns `None` when `sub`
/// leaves no room for a label of the minimum length.
pub fn unlikely_name(sub: &str) -> Option<String> {
    let sub = normalize(sub);
    let room = MAX_DNS_NAME_LEN.checked_sub(sub.len() + 1)?;
    let max_len = MAX_LABEL_LEN.min(room);
    if max_len < MIN_LABEL_LEN {
        return None;
    }

    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let len = rng.gen_range(MIN_LABEL_LEN, max_len + 1);
        let label: String = (0..len)
            .map(|_| LDH_CHARS[rng.gen_range(0, LDH_CHARS.len())] as char)
            .collect();
        let label = label.trim_matches('-');
        if label.len() >= MIN_LABEL_LEN {
            return Some(format!("{}.{}", label, sub));
        }
    }

    None
}
