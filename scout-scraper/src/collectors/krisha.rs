use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;

use scout_common::listing::{RawListing, Source};

use super::{CollectError, Collector};

/// Collector for the krisha.kz search results page. The markup details are
/// volatile by nature; everything here is best-effort and a card that fails
/// to parse is skipped rather than failing the run.
pub struct KrishaCollector {
    client: reqwest::Client,
    base_url: String,
    search_path: String,
    city: String,
    interval: Duration,
    card: Selector,
    title: Selector,
    price: Selector,
    subtitle: Selector,
}

impl KrishaCollector {
    pub fn new(
        base_url: String,
        search_path: String,
        city: String,
        interval: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
            .build()
            .expect("failed to construct reqwest client for krisha collector");

        Self {
            client,
            base_url,
            search_path,
            city,
            interval,
            card: Selector::parse("div.a-card").expect("valid card selector"),
            title: Selector::parse(".a-card__title").expect("valid title selector"),
            price: Selector::parse(".a-card__price").expect("valid price selector"),
            subtitle: Selector::parse(".a-card__subtitle").expect("valid subtitle selector"),
        }
    }

    pub fn parse_search_page(&self, html: &str) -> Vec<RawListing> {
        let document = Html::parse_document(html);
        let mut listings = Vec::new();

        for card in document.select(&self.card) {
            let Some(external_id) = card.value().attr("data-id") else {
                continue;
            };

            let title = card
                .select(&self.title)
                .next()
                .map(|e| collapse_whitespace(&e.text().collect::<String>()))
                .unwrap_or_default();
            let price_text = card
                .select(&self.price)
                .next()
                .map(|e| e.text().collect::<String>())
                .unwrap_or_default();
            let location = card
                .select(&self.subtitle)
                .next()
                .map(|e| collapse_whitespace(&e.text().collect::<String>()));

            let raw_text = match &location {
                Some(location) => format!("{}\n{}", title, location),
                None => title.clone(),
            };

            listings.push(RawListing {
                source: Source::Krisha,
                external_id: external_id.to_owned(),
                url: Some(format!("{}/a/show/{}", self.base_url, external_id)),
                price: parse_digits(&price_text),
                rooms: parse_rooms(&title),
                city: Some(self.city.clone()),
                location,
                area_sqm: parse_area_sqm(&title),
                raw_text,
                enrichment: None,
            });
        }

        debug!("parsed {} cards from search page", listings.len());
        listings
    }
}

#[async_trait]
impl Collector for KrishaCollector {
    fn name(&self) -> &str {
        "krisha"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&self) -> Result<Vec<RawListing>, CollectError> {
        let url = format!("{}{}", self.base_url, self.search_path);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "search page returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        Ok(self.parse_search_page(&body))
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Concatenate all digits of `text`, so "150 000 〒" parses as 150000.
fn parse_digits(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Room count from titles shaped like "2-комнатная квартира, 45 м², 3/9 этаж".
fn parse_rooms(title: &str) -> Option<i32> {
    let prefix = title.split('-').next()?;
    prefix.trim().parse().ok()
}

fn parse_area_sqm(title: &str) -> Option<f32> {
    let segment = title.split(',').find(|part| part.contains("м²"))?;
    let number: String = segment
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    number.parse().ok()
}
