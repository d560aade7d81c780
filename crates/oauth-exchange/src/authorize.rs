//! Authorization redirect construction
//!
//! The user starts the flow by visiting the provider's authorize page with
//! our client id, redirect URI, requested scopes and an opaque `state` value
//! that comes back unchanged on the callback.

use reqwest::Url;

/// Normalize a configured scope list into the space-delimited form the
/// provider expects.
///
/// Operators write scopes comma separated, space separated, or copied out
/// of an already-encoded URL (`%20`). All three collapse to single spaces.
pub fn normalize_scopes(raw: &str) -> String {
    raw.replace("%20", " ")
        .split([' ', ','])
        .filter(|scope| !scope.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the full authorization URL.
///
/// `scopes` should already be normalized. Existing query parameters on
/// `authorize_url` are preserved.
pub fn authorization_url(
    authorize_url: &Url,
    client_id: &str,
    redirect_uri: &str,
    scopes: &str,
    state: &str,
) -> Url {
    let mut url = authorize_url.clone();
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", scopes)
        .append_pair("state", state);
    url
}
