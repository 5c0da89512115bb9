//! Query-string helpers for channel URLs.

use rand::Rng;
use url::Url;

use crate::error::WebChannelResult;

const ZX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ZX_LEN: usize = 12;

/// Sets `key` to `value`, replacing any existing occurrences.
pub(crate) fn set_param(url: &mut Url, key: &str, value: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &kept {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(key, value);
}

pub(crate) fn set_params<'a, I>(url: &mut Url, params: I)
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    for (key, value) in params {
        set_param(url, key, value);
    }
}

pub(crate) fn get_param(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Adds a random `zx` parameter so intermediaries never serve a cached copy.
pub(crate) fn make_unique<R: Rng + ?Sized>(url: &mut Url, rng: &mut R) {
    let token: String = (0..ZX_LEN)
        .map(|_| ZX_ALPHABET[rng.gen_range(0..ZX_ALPHABET.len())] as char)
        .collect();
    set_param(url, "zx", &token);
}

/// Resolves a channel path against the configured base and prepends the host
/// prefix to the hostname when one is given.
pub(crate) fn data_uri(
    base: Option<&Url>,
    path: &str,
    host_prefix: Option<&str>,
) -> WebChannelResult<Url> {
    let mut url = match Url::parse(path) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => base.join(path)?,
            None => return Err(url::ParseError::RelativeUrlWithoutBase.into()),
        },
        Err(err) => return Err(err.into()),
    };
    if let Some(prefix) = host_prefix.filter(|p| !p.is_empty()) {
        if let Some(host) = url.host_str().map(str::to_string) {
            url.set_host(Some(&format!("{prefix}.{host}")))?;
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn set_param_replaces_existing_value() {
        let mut url = Url::parse("http://h/channel?RID=1&x=y&RID=2").unwrap();
        set_param(&mut url, "RID", "rpc");
        assert_eq!(url.as_str(), "http://h/channel?x=y&RID=rpc");
        assert_eq!(get_param(&url, "RID").as_deref(), Some("rpc"));
    }

    #[test]
    fn zx_is_random_base36() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut a = Url::parse("http://h/c").unwrap();
        let mut b = a.clone();
        make_unique(&mut a, &mut rng);
        make_unique(&mut b, &mut rng);
        let za = get_param(&a, "zx").unwrap();
        assert_eq!(za.len(), ZX_LEN);
        assert!(za.bytes().all(|c| ZX_ALPHABET.contains(&c)));
        assert_ne!(za, get_param(&b, "zx").unwrap());
    }

    #[test]
    fn data_uri_resolves_and_prefixes() {
        let base = Url::parse("http://example.com:8080/app/").unwrap();
        let url = data_uri(Some(&base), "/channel/bind", Some("b1")).unwrap();
        assert_eq!(url.as_str(), "http://b1.example.com:8080/channel/bind");

        let url = data_uri(None, "https://other.org/test", None).unwrap();
        assert_eq!(url.as_str(), "https://other.org/test");

        assert!(data_uri(None, "/relative", None).is_err());
    }
}
