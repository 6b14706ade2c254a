//! IMDb technical specs scraper

use super::MetadataSource;
use crate::aspect::AspectRatio;
use crate::config::MetadataConfig;
use crate::error::ResolveError;
use crate::title::{normalize_imdb_id, Title, TitleKind};
use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

static TECHSPEC_ASPECT: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"li[data-testid="title-techspec_aspectratio"]"#).expect("static selector")
});
static TXT_BLOCK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.txt-block").expect("static selector"));
static HEADING: Lazy<Selector> = Lazy::new(|| Selector::parse("h4").expect("static selector"));
static TITLE_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"a[href^="/title/tt"]"#).expect("static selector"));

pub struct ImdbSource {
    client: reqwest::Client,
    base_url: String,
}

impl ImdbSource {
    pub fn new(config: &MetadataConfig) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, url: &str, query: &[(&str, &str)]) -> Result<String, ResolveError> {
        debug!("GET {} {:?}", url, query);
        let body = self
            .client
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        if body.trim().is_empty() {
            return Err(ResolveError::Malformed);
        }
        Ok(body)
    }

    /// First title hit of a name search
    async fn search(&self, title: &Title) -> Result<Option<String>, ResolveError> {
        let q = match title.year {
            Some(year) => format!("{} {}", title.name, year),
            None => title.name.clone(),
        };
        let url = format!("{}/find/", self.base_url);
        let body = self.fetch(&url, &[("q", q.as_str()), ("s", "tt")]).await?;
        Ok(first_title_id(&body))
    }
}

#[async_trait]
impl MetadataSource for ImdbSource {
    async fn lookup(&self, title: &Title) -> Result<Option<AspectRatio>, ResolveError> {
        if title.kind() == TitleKind::TvShow {
            return Err(ResolveError::NotQueryable(title.key.to_string()));
        }

        let id = match &title.imdb_id {
            Some(id) => id.clone(),
            None if title.name.is_empty() => {
                return Err(ResolveError::NotQueryable(title.key.to_string()))
            }
            None => match self.search(title).await? {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let url = format!("{}/title/{}/", self.base_url, id);
        let body = self.fetch(&url, &[]).await?;
        Ok(parse_aspect_ratio(&body))
    }
}

/// Aspect ratio from a title page, current layout first
pub fn parse_aspect_ratio(html: &str) -> Option<AspectRatio> {
    let document = Html::parse_document(html);

    if let Some(item) = document.select(&TECHSPEC_ASPECT).next() {
        let text: String = item.text().collect::<Vec<_>>().join(" ");
        if let Some(ratio) = extract_ratio(&text) {
            return Some(ratio);
        }
    }

    // Older pages: <div class="txt-block"><h4>Aspect Ratio:</h4> 2.35 : 1</div>
    document
        .select(&TXT_BLOCK)
        .filter(|block| {
            block
                .select(&HEADING)
                .next()
                .map(|h| h.text().collect::<String>().contains("Aspect Ratio"))
                .unwrap_or(false)
        })
        .find_map(|block| extract_ratio(&block.text().collect::<Vec<_>>().join(" ")))
}

/// First `N.NN : 1` in a block of text
fn extract_ratio(text: &str) -> Option<AspectRatio> {
    for (i, _) in text.match_indices(':') {
        let after = text[i + 1..].trim_start();
        if !after.starts_with('1') {
            continue;
        }

        let before = text[..i].trim_end();
        let start = before
            .char_indices()
            .rev()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(p, c)| p + c.len_utf8())
            .unwrap_or(0);
        if let Ok(value) = before[start..].parse::<f64>() {
            let ratio = AspectRatio::from_value(value);
            if ratio.is_known() {
                return Some(ratio);
            }
        }
    }
    None
}

fn first_title_id(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&TITLE_LINK)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| {
            let id = href.trim_start_matches("/title/").split('/').next()?;
            normalize_imdb_id(id)
        })
}
