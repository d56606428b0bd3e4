use crate::config::FormatDefinition;
use crate::error::PipelineError;

/// What the caller asked for. Name wins over extension, extension over
/// Accept; with none of them the first format is used.
#[derive(Debug, Clone, Default)]
pub struct FormatRequest {
    pub name: Option<String>,
    pub extension: Option<String>,
    /// Raw `Accept` header value.
    pub accept: Option<String>,
}

impl FormatRequest {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    pub fn by_extension(extension: impl Into<String>) -> Self {
        Self { extension: Some(extension.into()), ..Self::default() }
    }

    pub fn by_accept(accept: impl Into<String>) -> Self {
        Self { accept: Some(accept.into()), ..Self::default() }
    }
}

pub fn select_format<'a>(formats: &'a [FormatDefinition], request: &FormatRequest) -> Result<&'a FormatDefinition, PipelineError> {
    let Some(first) = formats.first() else {
        return Err(PipelineError::Format("the pipeline defines no formats".into()));
    };

    if let Some(name) = request.name.as_deref().filter(|n| !n.is_empty()) {
        return formats.iter().find(|f| f.name() == name).ok_or_else(|| {
            tracing::info!(requested = name, supported = ?names(formats, FormatDefinition::name), "unsupported format requested");
            PipelineError::Format(format!("the requested format '{name}' is not supported for this request"))
        });
    }

    if let Some(extension) = request.extension.as_deref().filter(|e| !e.is_empty()) {
        let extension = extension.trim_start_matches('.');
        return formats.iter().find(|f| f.extension().eq_ignore_ascii_case(extension)).ok_or_else(|| {
            tracing::info!(requested = extension, supported = ?names(formats, FormatDefinition::extension), "unsupported extension requested");
            PipelineError::Format(format!("the requested extension '{extension}' is not supported for this request"))
        });
    }

    if let Some(accept) = request.accept.as_deref().filter(|a| !a.trim().is_empty()) {
        for range in parse_accept(accept) {
            if let Some(format) = formats.iter().find(|f| range.matches(f.media_type())) {
                return Ok(format);
            }
        }
        tracing::info!(requested = accept, supported = ?names(formats, FormatDefinition::media_type), "unsupported media type requested");
        return Err(PipelineError::Format(format!("the requested media type '{accept}' is not supported for this request")));
    }

    Ok(first)
}

fn names<'a>(formats: &'a [FormatDefinition], f: fn(&'a FormatDefinition) -> &'a str) -> Vec<&'a str> {
    formats.iter().map(f).collect()
}

#[derive(Debug, PartialEq)]
struct MediaRange {
    kind: String,
    subtype: String,
    quality: f32,
}

impl MediaRange {
    fn specificity(&self) -> u8 {
        match (self.kind.as_str(), self.subtype.as_str()) {
            ("*", _) => 0,
            (_, "*") => 1,
            _ => 2,
        }
    }

    fn matches(&self, media_type: &str) -> bool {
        let essence = media_type.split(';').next().unwrap_or_default().trim();
        let Some((kind, subtype)) = essence.split_once('/') else {
            return false;
        };
        (self.kind == "*" || self.kind.eq_ignore_ascii_case(kind))
            && (self.subtype == "*" || self.subtype.eq_ignore_ascii_case(subtype))
    }
}

/// Parse an Accept header into ranges ordered by preference: quality first,
/// then specificity. Ranges with `q=0` are dropped.
fn parse_accept(accept: &str) -> Vec<MediaRange> {
    let mut ranges: Vec<MediaRange> = accept
        .split(',')
        .filter_map(|part| {
            let mut params = part.split(';');
            let (kind, subtype) = params.next()?.trim().split_once('/')?;
            let quality = params
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some(MediaRange { kind: kind.trim().to_string(), subtype: subtype.trim().to_string(), quality })
        })
        .filter(|r| r.quality > 0.0)
        .collect();
    ranges.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.specificity().cmp(&a.specificity()))
    });
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineDefinition;

    fn formats() -> Vec<FormatDefinition> {
        let text = r#"
[source]
type = "test"

[[formats]]
type = "json"

[[formats]]
type = "delimited"
name = "tab"
extension = "tsv"
media_type = "text/tab-separated-values"

[[formats]]
type = "html"
"#;
        PipelineDefinition::parse(text, "formats").unwrap().formats
    }

    #[test]
    fn default_is_first() {
        let formats = formats();
        assert_eq!(select_format(&formats, &FormatRequest::default()).unwrap().name(), "json");
    }

    #[test]
    fn by_name_and_extension() {
        let formats = formats();
        assert_eq!(select_format(&formats, &FormatRequest::by_name("tab")).unwrap().name(), "tab");
        assert_eq!(select_format(&formats, &FormatRequest::by_extension(".TSV")).unwrap().name(), "tab");
        assert!(select_format(&formats, &FormatRequest::by_name("xml")).is_err());
        assert!(select_format(&formats, &FormatRequest::by_extension("xlsx")).is_err());
    }

    #[test]
    fn name_takes_precedence_over_accept() {
        let formats = formats();
        let request = FormatRequest { name: Some("html".into()), accept: Some("application/json".into()), ..Default::default() };
        assert_eq!(select_format(&formats, &request).unwrap().name(), "html");
    }

    #[test]
    fn accept_respects_quality_and_wildcards() {
        let formats = formats();
        let pick = |accept: &str| select_format(&formats, &FormatRequest::by_accept(accept)).map(|f| f.name().to_string());

        assert_eq!(pick("text/html").unwrap(), "html");
        assert_eq!(pick("application/json;q=0.5, text/html").unwrap(), "html");
        assert_eq!(pick("text/*;q=0.9, application/json;q=0.1").unwrap(), "tab");
        assert_eq!(pick("*/*").unwrap(), "json");
        assert!(pick("image/png").is_err());
        assert!(pick("text/html;q=0").is_err());
    }

    #[test]
    fn accept_ranges_sorted_by_specificity() {
        let ranges = parse_accept("*/*, text/*, text/html");
        let order: Vec<_> = ranges.iter().map(|r| format!("{}/{}", r.kind, r.subtype)).collect();
        assert_eq!(order, ["text/html", "text/*", "*/*"]);
    }
}
