//! Facet keys and derived location strings.
//!
//! The search index facets on opaque `{slug}/{segment}::{display}` strings.
//! Everything that produces one goes through [`FacetKey::encode`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MocRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FacetSegment {
    JobsIn,
    Jobs,
    Careers,
    VetJobs,
}

impl FacetSegment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobsIn => "jobs-in",
            Self::Jobs => "jobs",
            Self::Careers => "careers",
            Self::VetJobs => "vet-jobs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FacetKey {
    pub slug: String,
    pub segment: FacetSegment,
    pub display: String,
}

impl FacetKey {
    pub fn new(slug: impl Into<String>, segment: FacetSegment, display: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            segment,
            display: display.into(),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn title(title: &str) -> Option<Self> {
        let slug = usable_slug(title)?;
        Some(Self::new(slug, FacetSegment::JobsIn, title.trim()))
    }

    /// `region_short` is the state abbreviation, or the country code when the
    /// job has no state.
    pub fn city(city: Option<&str>, region_short: Option<&str>, location: &str) -> Option<Self> {
        let city_slug = usable_slug(city?)?;
        let slug = [Some(city_slug), region_short.map(slugify)]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Some(Self::new(slug, FacetSegment::Jobs, location))
    }

    pub fn state(state: Option<&str>, country_short: Option<&str>) -> Option<Self> {
        let state = state?.trim();
        let state_slug = usable_slug(state)?;
        let slug = match country_short.map(slugify).filter(|s| !s.is_empty()) {
            Some(country) => format!("{state_slug}/{country}"),
            None => state_slug,
        };
        Some(Self::new(slug, FacetSegment::Jobs, state))
    }

    pub fn country(country_short: Option<&str>, country: Option<&str>) -> Option<Self> {
        let short = country_short.map(str::trim).filter(|s| !s.is_empty());
        let name = country.map(str::trim).filter(|s| !s.is_empty());
        let slug = slugify(short.or(name)?);
        if slug.is_empty() {
            return None;
        }
        Some(Self::new(slug, FacetSegment::Jobs, name.or(short).unwrap_or_default()))
    }

    pub fn company(name: &str) -> Option<Self> {
        let name = name.trim();
        let slug = slugify(name);
        if slug.is_empty() {
            return None;
        }
        Some(Self::new(slug, FacetSegment::Careers, name))
    }

    pub fn occupation(moc: &MocRecord) -> Self {
        Self::new(
            format!("{}/{}/{}", slugify(&moc.title), moc.code, moc.branch),
            FacetSegment::VetJobs,
            format!("{} - {}", moc.code, moc.title),
        )
    }
}

impl fmt::Display for FacetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}::{}", self.slug, self.segment.as_str(), self.display)
    }
}

pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn usable_slug(input: &str) -> Option<String> {
    let slug = slugify(input);
    if slug.is_empty() || slug == "none" {
        None
    } else {
        Some(slug)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Display location, first match wins: city+state, city+country,
/// state+country, virtual-in-country, global.
pub fn compose_location(
    city: Option<&str>,
    state_short: Option<&str>,
    country_short: Option<&str>,
) -> String {
    match (non_blank(city), non_blank(state_short), non_blank(country_short)) {
        (Some(city), Some(state), _) => format!("{city}, {state}"),
        (Some(city), None, Some(country)) => format!("{city}, {country}"),
        (None, Some(state), Some(country)) => format!("{state}, {country}"),
        (_, _, Some(country)) => format!("Virtual, {country}"),
        _ => "Global".to_string(),
    }
}

pub fn compose_full_loc(
    city: Option<&str>,
    state: Option<&str>,
    location: &str,
    country: Option<&str>,
) -> String {
    [
        ("city", non_blank(city)),
        ("state", non_blank(state)),
        ("location", Some(location)),
        ("country", non_blank(country)),
    ]
    .into_iter()
    .filter_map(|(field, value)| value.map(|v| format!("{field}::{v}")))
    .collect::<Vec<_>>()
    .join("@@")
}
