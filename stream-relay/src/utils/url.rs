//! URL helpers.

use url::Url;

/// Host serving raw Dropbox file contents.
const DROPBOX_DIRECT_HOST: &str = "dl.dropboxusercontent.com";

/// Converts a shared-file link into a direct-download link.
///
/// Dropbox share pages (`www.dropbox.com/...?dl=0`) are rewritten to the raw
/// content host with the `dl` parameter removed; other query parameters (for
/// example `rlkey`) are kept. Anything else, including strings that are not
/// URLs at all (local files), is returned unchanged.
pub fn normalize_source_url(input: &str) -> String {
    let Ok(mut url) = Url::parse(input.trim()) else {
        return input.to_string();
    };

    let is_dropbox = matches!(url.host_str(), Some("www.dropbox.com" | "dropbox.com"));
    if !is_dropbox {
        return input.to_string();
    }

    if url.set_host(Some(DROPBOX_DIRECT_HOST)).is_err() {
        return input.to_string();
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "dl")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    url.to_string()
}
