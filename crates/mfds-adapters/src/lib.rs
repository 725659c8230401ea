//! MFDS portal adapter: portal profile, list-page candidate scanning and
//! label-driven detail extraction.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use mfds_core::{normalize_ingredients, DrugDetail};
use mfds_storage::{FetchError, HttpClientConfig, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mfds-adapters";

pub const DEFAULT_LIST_URL: &str = "https://nedrug.mfds.go.kr/pbp/CCBAE01";
pub const DEFAULT_DETAIL_URL: &str = "https://nedrug.mfds.go.kr/pbp/CCBBB01/getItemDetail";
pub const ITEM_SEQ_PARAM: &str = "itemSeq";

static ITEM_SEQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"itemSeq=(\d+)").expect("item seq pattern is valid"));
static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("table selector is valid"));
static TR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("tr selector is valid"));
static TD: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("td selector is valid"));
static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a").expect("anchor selector is valid"));

const LABEL_CONTAINERS: &[&str] = &["th", "dt"];
const VALUE_CELLS: &[&str] = &["td", "dd"];
const SECTION_BLOCKS: &[&str] = &["div", "table", "td", "dd"];

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("reading profile {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing profile: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("section heading for {0} has no words")]
    EmptyHeading(&'static str),
    #[error("invalid heading pattern {heading:?}: {source}")]
    Heading {
        heading: Vec<String>,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Endpoints and markup vocabulary of the registration portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalProfile {
    pub list_url: String,
    pub detail_url: String,
    pub list: ListLayout,
    pub detail: DetailLayout,
}

impl Default for PortalProfile {
    fn default() -> Self {
        Self {
            list_url: DEFAULT_LIST_URL.to_string(),
            detail_url: DEFAULT_DETAIL_URL.to_string(),
            list: ListLayout::default(),
            detail: DetailLayout::default(),
        }
    }
}

impl PortalProfile {
    pub fn from_yaml_str(text: &str) -> Result<Self, ProfileError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn detail_url_for(&self, item_seq: &str) -> String {
        detail_url_for(&self.detail_url, item_seq)
    }
}

pub fn detail_url_for(endpoint: &str, item_seq: &str) -> String {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{sep}{ITEM_SEQ_PARAM}={item_seq}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListLayout {
    /// Header variants in priority order, matched as substrings after all
    /// whitespace is removed.
    pub product_name_headers: Vec<String>,
    pub cancel_date_headers: Vec<String>,
    pub product_name_fallback: usize,
    pub cancel_date_fallback: usize,
}

impl Default for ListLayout {
    fn default() -> Self {
        Self {
            product_name_headers: strings(&["제품명", "품목명"]),
            cancel_date_headers: strings(&[
                "취소/취하일자",
                "취소취하일자",
                "취소/취하",
                "취하일자",
                "취소일자",
            ]),
            product_name_fallback: 0,
            cancel_date_fallback: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLabels {
    pub product_name: String,
    pub company_name: String,
    pub cmo_names: String,
    pub rx_otc: String,
    pub review_type: String,
    pub approval_date: String,
}

impl Default for FieldLabels {
    fn default() -> Self {
        Self {
            product_name: "제품명".into(),
            company_name: "업체명".into(),
            cmo_names: "위탁제조업체".into(),
            rx_otc: "전문/일반".into(),
            review_type: "허가심사유형".into(),
            approval_date: "허가일자".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueStrategy {
    SiblingCell,
    FollowingCell,
}

impl ValueStrategy {
    fn locate<'a>(self, document: &'a Html, container: ElementRef<'a>) -> Option<ElementRef<'a>> {
        match self {
            Self::SiblingCell => container
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|e| is_named(e, VALUE_CELLS)),
            Self::FollowingCell => {
                following_elements(document, container).find(|e| is_named(e, VALUE_CELLS))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailLayout {
    pub labels: FieldLabels,
    /// Heading words; any whitespace (or none) may separate them on the page.
    pub efficacy_heading: Vec<String>,
    pub ingredients_heading: Vec<String>,
    pub value_strategies: Vec<ValueStrategy>,
}

impl Default for DetailLayout {
    fn default() -> Self {
        Self {
            labels: FieldLabels::default(),
            efficacy_heading: strings(&["효능", "효과"]),
            ingredients_heading: strings(&["원료약품", "및", "분량"]),
            value_strategies: vec![ValueStrategy::SiblingCell, ValueStrategy::FollowingCell],
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    ProductName,
    CancelDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedColumn {
    pub index: usize,
    pub via_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnMap {
    pub product_name: ResolvedColumn,
    pub cancel_date: ResolvedColumn,
}

impl ColumnMap {
    pub fn resolve(headers: &[String], layout: &ListLayout) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| strip_whitespace(h)).collect();
        let resolve = |variants: &[String], fallback: usize| match match_header(&normalized, variants) {
            Some(index) => ResolvedColumn {
                index,
                via_fallback: false,
            },
            None => ResolvedColumn {
                index: fallback,
                via_fallback: true,
            },
        };
        Self {
            product_name: resolve(&layout.product_name_headers, layout.product_name_fallback),
            cancel_date: resolve(&layout.cancel_date_headers, layout.cancel_date_fallback),
        }
    }

    pub fn get(&self, role: ColumnRole) -> ResolvedColumn {
        match role {
            ColumnRole::ProductName => self.product_name,
            ColumnRole::CancelDate => self.cancel_date,
        }
    }

    pub fn fallbacks(&self) -> Vec<ColumnRole> {
        [ColumnRole::ProductName, ColumnRole::CancelDate]
            .into_iter()
            .filter(|role| self.get(*role).via_fallback)
            .collect()
    }

    pub fn required_cells(&self) -> usize {
        self.product_name.index.max(self.cancel_date.index) + 1
    }
}

fn match_header(normalized_headers: &[String], variants: &[String]) -> Option<usize> {
    variants
        .iter()
        .map(|v| strip_whitespace(v))
        .filter(|v| !v.is_empty())
        .find_map(|v| normalized_headers.iter().position(|h| h.contains(&v)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListScan {
    pub candidates: Vec<String>,
    pub columns: Option<ColumnMap>,
    pub cancelled_rows: usize,
    pub rows_without_item_seq: usize,
}

/// Candidates from a list page. Markup without a table yields an empty scan.
pub fn scan_list_page(html: &str, layout: &ListLayout) -> ListScan {
    let document = Html::parse_document(html);
    let Some(table) = document.select(&TABLE).next() else {
        return ListScan::default();
    };

    let rows: Vec<ElementRef> = table.select(&TR).collect();
    let header_pos = rows
        .iter()
        .position(|row| row_cells(*row, &["th"]).next().is_some())
        .unwrap_or(0);
    let headers: Vec<String> = rows
        .get(header_pos)
        .map(|row| {
            row_cells(*row, &["th", "td"])
                .map(|cell| joined_text(cell, " "))
                .collect()
        })
        .unwrap_or_default();

    let columns = ColumnMap::resolve(&headers, layout);
    for role in columns.fallbacks() {
        warn!(
            ?role,
            index = columns.get(role).index,
            ?headers,
            "list header not recognised; using positional fallback"
        );
    }

    let mut scan = ListScan {
        columns: Some(columns),
        ..ListScan::default()
    };
    let mut seen = HashSet::new();

    for (pos, row) in rows.iter().enumerate() {
        if pos == header_pos {
            continue;
        }
        let cells: Vec<ElementRef> = row_cells(*row, &["td"]).collect();
        if cells.len() < columns.required_cells() {
            continue;
        }
        let Some(item_seq) = item_seq_in_row(*row, cells[columns.product_name.index]) else {
            scan.rows_without_item_seq += 1;
            continue;
        };
        if !joined_text(cells[columns.cancel_date.index], " ").is_empty() {
            scan.cancelled_rows += 1;
            continue;
        }
        if seen.insert(item_seq.clone()) {
            scan.candidates.push(item_seq);
        }
    }

    debug!(
        candidates = scan.candidates.len(),
        cancelled = scan.cancelled_rows,
        without_item_seq = scan.rows_without_item_seq,
        "scanned list page"
    );
    scan
}

fn row_cells<'a>(
    row: ElementRef<'a>,
    names: &'static [&'static str],
) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(move |e| is_named(e, names))
}

fn item_seq_in_row<'a>(row: ElementRef<'a>, product_cell: ElementRef<'a>) -> Option<String> {
    product_cell
        .select(&ANCHOR)
        .chain(row.select(&ANCHOR))
        .find_map(|a| {
            ["href", "onclick"]
                .into_iter()
                .filter_map(|attr| a.value().attr(attr))
                .find_map(item_seq_in)
        })
}

pub fn item_seq_in(text: &str) -> Option<String> {
    ITEM_SEQ_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Pulls a [`DrugDetail`] out of a detail page. Sections that cannot be found
/// come back empty; extraction never fails on markup.
#[derive(Debug, Clone)]
pub struct DetailExtractor {
    layout: DetailLayout,
    efficacy_heading: Regex,
    ingredients_heading: Regex,
}

impl DetailExtractor {
    pub fn new(layout: DetailLayout) -> Result<Self, ProfileError> {
        let efficacy_heading = heading_pattern("efficacy", &layout.efficacy_heading)?;
        let ingredients_heading = heading_pattern("ingredients", &layout.ingredients_heading)?;
        Ok(Self {
            layout,
            efficacy_heading,
            ingredients_heading,
        })
    }

    pub fn extract(&self, item_seq: &str, source_url: &str, html: &str) -> DrugDetail {
        let document = Html::parse_document(html);
        let labels = &self.layout.labels;
        let field = |label: &str| {
            extract_labeled_value(&document, label, &self.layout.value_strategies).unwrap_or_default()
        };

        let detail = DrugDetail {
            item_seq: item_seq.to_string(),
            product_name: field(&labels.product_name),
            company_name: field(&labels.company_name),
            cmo_names: field(&labels.cmo_names),
            rx_otc: field(&labels.rx_otc),
            review_type: field(&labels.review_type),
            approval_date: field(&labels.approval_date),
            efficacy_text: extract_section_text(&document, &self.efficacy_heading),
            source_url: source_url.to_string(),
            ingredients: extract_ingredients(&document, &self.ingredients_heading),
        };
        debug!(
            item_seq,
            product_name = %detail.product_name,
            ingredients = detail.ingredients.len(),
            "extracted detail"
        );
        detail
    }
}

fn heading_pattern(section: &'static str, words: &[String]) -> Result<Regex, ProfileError> {
    let words: Vec<String> = words
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .map(regex::escape)
        .collect();
    if words.is_empty() {
        return Err(ProfileError::EmptyHeading(section));
    }
    Regex::new(&words.join(r"\s*")).map_err(|source| ProfileError::Heading {
        heading: words.clone(),
        source,
    })
}

/// Value paired with the text node equal to `label` (whitespace ignored).
///
/// The label must sit inside a `th` or `dt`; the first matching text node that
/// does is used, and `strategies` are tried in order from there.
pub fn extract_labeled_value(
    document: &Html,
    label: &str,
    strategies: &[ValueStrategy],
) -> Option<String> {
    let wanted = strip_whitespace(label);
    if wanted.is_empty() {
        return None;
    }
    let container = document
        .tree
        .root()
        .descendants()
        .filter(|n| node_text(n.value()).is_some_and(|t| strip_whitespace(t) == wanted))
        .find_map(|n| {
            n.ancestors()
                .filter_map(ElementRef::wrap)
                .find(|e| is_named(e, LABEL_CONTAINERS))
        })?;

    strategies
        .iter()
        .find_map(|strategy| strategy.locate(document, container))
        .map(|cell| joined_text(cell, " "))
}

pub fn extract_section_text(document: &Html, heading: &Regex) -> String {
    section_heading(document, heading)
        .and_then(|h| following_elements(document, h).find(|e| is_named(e, SECTION_BLOCKS)))
        .map(|block| joined_text(block, "\n"))
        .unwrap_or_default()
}

pub fn extract_ingredients(document: &Html, heading: &Regex) -> Vec<String> {
    let Some(table) = section_heading(document, heading)
        .and_then(|h| following_elements(document, h).find(|e| is_named(e, &["table"])))
    else {
        return Vec::new();
    };
    let names = table
        .select(&TR)
        .skip(1)
        .filter_map(|row| row.select(&TD).next())
        .map(|cell| joined_text(cell, " "));
    normalize_ingredients(names)
}

fn section_heading<'a>(document: &'a Html, heading: &Regex) -> Option<ElementRef<'a>> {
    document
        .tree
        .root()
        .descendants()
        .find(|n| node_text(n.value()).is_some_and(|t| heading.is_match(t)))
        .and_then(|n| n.parent())
        .and_then(ElementRef::wrap)
}

fn following_elements<'a>(
    document: &'a Html,
    anchor: ElementRef<'a>,
) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    let anchor_id = (*anchor).id();
    document
        .tree
        .root()
        .descendants()
        .skip_while(move |n| n.id() != anchor_id)
        .skip(1)
        .filter_map(ElementRef::wrap)
}

fn node_text(node: &Node) -> Option<&str> {
    node.as_text().map(|t| &**t)
}

fn is_named(element: &ElementRef<'_>, names: &[&str]) -> bool {
    names.contains(&element.value().name())
}

fn joined_text(element: ElementRef<'_>, sep: &str) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

#[async_trait]
pub trait PortalClient: Send + Sync {
    async fn fetch_list_page(&self) -> Result<String, PortalError>;

    async fn fetch_detail_page(&self, item_seq: &str) -> Result<String, PortalError>;

    /// Audit URL stored with the product; not used as a lookup key.
    fn detail_url(&self, item_seq: &str) -> String;
}

#[derive(Debug)]
pub struct HttpPortal {
    http: HttpFetcher,
    list_url: String,
    detail_endpoint: String,
}

impl HttpPortal {
    pub fn new(http_config: HttpClientConfig, profile: &PortalProfile) -> anyhow::Result<Self> {
        Ok(Self::with_fetcher(HttpFetcher::new(http_config)?, profile))
    }

    pub fn with_fetcher(http: HttpFetcher, profile: &PortalProfile) -> Self {
        Self {
            http,
            list_url: profile.list_url.clone(),
            detail_endpoint: profile.detail_url.clone(),
        }
    }
}

#[async_trait]
impl PortalClient for HttpPortal {
    async fn fetch_list_page(&self) -> Result<String, PortalError> {
        Ok(self.http.fetch_text(&self.list_url).await?.body)
    }

    async fn fetch_detail_page(&self, item_seq: &str) -> Result<String, PortalError> {
        let url = self.detail_url(item_seq);
        Ok(self.http.fetch_text(&url).await?.body)
    }

    fn detail_url(&self, item_seq: &str) -> String {
        detail_url_for(&self.detail_endpoint, item_seq)
    }
}

/// Serves canned markup. Unknown detail pages answer as HTTP 404.
#[derive(Debug, Clone, Default)]
pub struct StaticPortal {
    list_html: String,
    detail_endpoint: String,
    detail_pages: HashMap<String, String>,
}

impl StaticPortal {
    pub fn new(list_html: impl Into<String>) -> Self {
        Self {
            list_html: list_html.into(),
            detail_endpoint: DEFAULT_DETAIL_URL.to_string(),
            detail_pages: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, item_seq: impl Into<String>, html: impl Into<String>) -> Self {
        self.detail_pages.insert(item_seq.into(), html.into());
        self
    }
}

#[async_trait]
impl PortalClient for StaticPortal {
    async fn fetch_list_page(&self) -> Result<String, PortalError> {
        Ok(self.list_html.clone())
    }

    async fn fetch_detail_page(&self, item_seq: &str) -> Result<String, PortalError> {
        self.detail_pages.get(item_seq).cloned().ok_or_else(|| {
            PortalError::Fetch(FetchError::HttpStatus {
                status: 404,
                url: self.detail_url(item_seq),
            })
        })
    }

    fn detail_url(&self, item_seq: &str) -> String {
        detail_url_for(&self.detail_endpoint, item_seq)
    }
}

pub async fn fetch_detail(
    portal: &dyn PortalClient,
    extractor: &DetailExtractor,
    item_seq: &str,
) -> Result<DrugDetail, PortalError> {
    let html = portal.fetch_detail_page(item_seq).await?;
    Ok(extractor.extract(item_seq, &portal.detail_url(item_seq), &html))
}
