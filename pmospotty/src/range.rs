//! Analyse de l'en-tête HTTP `Range`.
//!
//! Les plages sont exprimées en coordonnées fichier avec une fin exclusive.
//! Une valeur mal formée ne fait jamais échouer la requête : elle est
//! traitée comme une demande de la plage complète.

/// Plage `[begin, end)` d'un fichier de `total` octets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub begin: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn full(total: u64) -> Self {
        Self {
            begin: 0,
            end: total,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }

    /// Valeur de l'en-tête `Content-Range`
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.begin, self.end, total)
    }
}

/// Nature de la réponse à produire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// Fichier complet, `200 OK`
    Full(ByteRange),
    /// Plage partielle, `206 Partial Content`
    Partial(ByteRange),
}

impl RangeRequest {
    pub fn range(&self) -> ByteRange {
        match self {
            RangeRequest::Full(r) | RangeRequest::Partial(r) => *r,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, RangeRequest::Partial(_))
    }
}

/// Interprète la valeur d'un en-tête `Range` pour un fichier de `total` octets.
///
/// - absent, vide ou exactement `bytes=0-` : fichier complet (`200`) ;
/// - `bytes=<s>-` / `bytes=<s>-<e>` : partiel, bornes ramenées dans `[0, total]` ;
/// - `bytes=-<n>` : les `n` derniers octets ;
/// - `bytes=` illisible : plage complète, mais toujours en `206` ;
/// - autre unité que `bytes` : ignorée, fichier complet.
pub fn parse_range(header: Option<&str>, total: u64) -> RangeRequest {
    let full = ByteRange::full(total);

    let Some(raw) = header.map(str::trim).filter(|h| !h.is_empty()) else {
        return RangeRequest::Full(full);
    };
    if raw == "bytes=0-" {
        return RangeRequest::Full(full);
    }

    let Some(ranges) = raw.strip_prefix("bytes=") else {
        return RangeRequest::Full(full);
    };

    RangeRequest::Partial(parse_byte_range(ranges, total).unwrap_or(full))
}

fn parse_byte_range(ranges: &str, total: u64) -> Option<ByteRange> {
    // Seule la première plage d'une liste est prise en compte
    let first = ranges.split(',').next().unwrap_or("").trim();
    let (start, end) = first.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let n = end.parse::<u64>().ok()?.min(total);
        return Some(ByteRange {
            begin: total - n,
            end: total,
        });
    }

    let begin = start.parse::<u64>().ok()?.min(total);
    let end = match end.parse::<u64>() {
        Ok(e) => e.clamp(begin, total),
        Err(_) => total,
    };
    Some(ByteRange { begin, end })
}
