//! Raw feed job to index document.

use jobfeed_adapters::render_description;
use jobfeed_core::{
    compose_full_loc, compose_location, document_id, slugify, CompanyRef, FacetKey, FeedSource,
    NormalizedJobDocument, RawJobNode,
};

use crate::occupations::SourceMappings;

/// Location-derived fields, split out so they can be checked on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationFields {
    pub location: String,
    pub full_loc: String,
    pub city_slab: Option<String>,
    pub state_slab: Option<String>,
    pub country_slab: Option<String>,
}

pub fn derive_location_fields(raw: &RawJobNode) -> LocationFields {
    let location = compose_location(
        raw.city.as_deref(),
        raw.state_short.as_deref(),
        raw.country_short.as_deref(),
    );
    let full_loc = compose_full_loc(
        raw.city.as_deref(),
        raw.state.as_deref(),
        &location,
        raw.country.as_deref(),
    );
    let region_short = raw.state_short.as_deref().or(raw.country_short.as_deref());

    LocationFields {
        city_slab: FacetKey::city(raw.city.as_deref(), region_short, &location).map(|k| k.encode()),
        state_slab: FacetKey::state(raw.state.as_deref(), raw.country_short.as_deref())
            .map(|k| k.encode()),
        country_slab: FacetKey::country(raw.country_short.as_deref(), raw.country.as_deref())
            .map(|k| k.encode()),
        location,
        full_loc,
    }
}

/// Transforms every job of one source. Holds the source's occupation
/// overrides so they are read once per feed.
pub struct JobTransformer {
    mappings: SourceMappings,
}

impl JobTransformer {
    pub fn new(mappings: SourceMappings) -> Self {
        Self { mappings }
    }

    pub fn transform(
        &self,
        raw: &RawJobNode,
        source: &FeedSource,
        company: Option<&CompanyRef>,
    ) -> NormalizedJobDocument {
        let LocationFields {
            location,
            full_loc,
            city_slab,
            state_slab,
            country_slab,
        } = derive_location_fields(raw);

        let company_name = company.map(|c| c.name.trim().to_string()).filter(|n| !n.is_empty());
        let company_slab = company_name
            .as_deref()
            .and_then(FacetKey::company)
            .map(|k| k.encode());
        let title_slab = FacetKey::title(&raw.title).map(|k| k.encode());

        let html_description = raw
            .description
            .as_deref()
            .map(|text| render_description(text, source.markdown_enabled))
            .unwrap_or_default();

        let onet_codes = raw.onet_codes();
        let occupations = self.mappings.resolve(&onet_codes);

        let text = search_text(raw, company_name.as_deref(), &location);

        NormalizedJobDocument {
            id: document_id(&source.source_id, &raw.uid),
            uid: raw.uid.clone(),
            source_id: source.source_id.clone(),
            title: raw.title.clone(),
            title_slug: slugify(&raw.title),
            title_slab,
            link: raw.link.clone(),
            city: raw.city.clone(),
            city_slab,
            state: raw.state.clone(),
            state_short: raw.state_short.clone(),
            state_slab,
            country: raw.country.clone(),
            country_short: raw.country_short.clone(),
            country_slab,
            location,
            full_loc,
            company: company_name,
            company_slab,
            description: raw.description.clone(),
            html_description,
            onet: onet_codes.into_iter().collect(),
            moc: occupations.standard.codes,
            moc_slab: occupations.standard.slabs,
            moc_id: occupations.standard.ids,
            mapped_moc: occupations.mapped.codes,
            mapped_moc_slab: occupations.mapped.slabs,
            mapped_moc_id: occupations.mapped.ids,
            date_new: raw.date_new,
            date_updated: raw.date_modified,
            is_posted: false,
            text,
        }
    }
}

fn search_text(raw: &RawJobNode, company: Option<&str>, location: &str) -> String {
    [
        Some(raw.title.as_str()),
        company,
        raw.description.as_deref(),
        raw.city.as_deref(),
        raw.state.as_deref(),
        raw.country.as_deref(),
        Some(location),
    ]
    .into_iter()
    .map(|field| field.unwrap_or("None"))
    .collect::<Vec<_>>()
    .join(" ")
}
