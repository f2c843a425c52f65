//! List/filter/paginate over an in-memory base set.
//!
//! Handlers load the candidate rows for a list, then hand them to a validated
//! [`ListQuery`] which filters, sorts and cuts out the requested page. Parameter
//! validation happens in [`ListParams::into_query`], before anything is loaded.

use std::cmp::Ordering;

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use blog_shared::PageMeta;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{respond, AppError};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const PAGINATION_HEADER: &str = "x-pagination";

/// Raw query-string parameters. Numbers arrive as strings so that junk values
/// fall back to defaults instead of rejecting the request.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page_number: Option<String>,
    pub page_size: Option<String>,
    pub search_term: Option<String>,
    pub tag: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub order_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// An entity the builder can filter.
pub trait Listable {
    /// Fields the free-text search looks at.
    fn search_fields(&self) -> Vec<&str>;

    fn published_on(&self) -> NaiveDateTime;

    /// Entities without tags accept every tag filter.
    fn has_tag(&self, _tag: &str) -> bool {
        true
    }
}

/// The closed set of sort keys for `T`.
pub trait SortKey<T>: Copy + Sized {
    const DEFAULT: Self;

    fn parse(name: &str) -> Option<Self>;

    fn compare(self, a: &T, b: &T) -> Ordering;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    fn contains(&self, at: NaiveDateTime) -> bool {
        let day = at.date();
        self.start.is_none_or(|start| day >= start) && self.end.is_none_or(|end| day <= end)
    }
}

#[derive(Debug, Clone)]
pub struct ListQuery<K> {
    pub page: u32,
    pub size: u32,
    pub search: Option<String>,
    pub tag: Option<String>,
    pub range: DateRange,
    pub sort: Vec<(K, Direction)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}

impl<T> PagedResult<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PagedResult<U> {
        PagedResult {
            items: self.items.into_iter().map(f).collect(),
            meta: self.meta,
        }
    }
}

impl<T: Serialize> PagedResult<T> {
    /// The items in the envelope body, the metadata in `X-Pagination`.
    pub fn respond(self, message: &str) -> Response {
        let mut response = respond(StatusCode::OK, self.items, message).into_response();
        match serde_json::to_string(&self.meta)
            .ok()
            .and_then(|meta| HeaderValue::from_str(&meta).ok())
        {
            Some(value) => {
                response.headers_mut().insert(PAGINATION_HEADER, value);
            }
            None => tracing::warn!("could not encode pagination header"),
        }
        response
    }
}

impl ListParams {
    /// Validates the parameters. Fails with [`AppError::InvalidRange`] when the
    /// start date lies after the end date.
    pub fn into_query<T, K: SortKey<T>>(self, max_page_size: u32) -> Result<ListQuery<K>, AppError> {
        let page = parse_number(self.page_number.as_deref())
            .filter(|n| *n >= 1)
            .unwrap_or(1)
            .min(u32::MAX as i64) as u32;
        let size = parse_number(self.page_size.as_deref())
            .unwrap_or(DEFAULT_PAGE_SIZE as i64)
            .clamp(1, max_page_size.max(1) as i64) as u32;

        let start = parse_date("startDate", self.start_date.as_deref())?;
        let end = parse_date("endDate", self.end_date.as_deref())?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(AppError::InvalidRange { start, end });
            }
        }

        Ok(ListQuery {
            page,
            size,
            search: non_blank(self.search_term).map(|s| s.to_lowercase()),
            tag: non_blank(self.tag),
            range: DateRange { start, end },
            sort: parse_sort::<T, K>(self.order_by.as_deref()),
        })
    }
}

impl<K> ListQuery<K> {
    pub fn skip(&self) -> usize {
        (self.page as usize - 1).saturating_mul(self.size as usize)
    }

    /// Filters, sorts and pages `items`. The total count is taken after
    /// filtering and before paging.
    pub fn run<T>(&self, items: Vec<T>) -> PagedResult<T>
    where
        T: Listable,
        K: SortKey<T>,
    {
        let mut matching: Vec<T> = items
            .into_iter()
            .filter(|item| self.range.contains(item.published_on()))
            .filter(|item| self.matches_search(item))
            .filter(|item| self.tag.as_deref().is_none_or(|tag| item.has_tag(tag)))
            .collect();

        matching.sort_by(|a, b| {
            self.sort
                .iter()
                .map(|(key, direction)| match direction {
                    Direction::Asc => key.compare(a, b),
                    Direction::Desc => key.compare(b, a),
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(self.skip())
            .take(self.size as usize)
            .collect();

        PagedResult {
            items,
            meta: PageMeta::new(self.page, self.size, total),
        }
    }

    fn matches_search<T: Listable>(&self, item: &T) -> bool {
        match &self.search {
            None => true,
            Some(term) => item
                .search_fields()
                .iter()
                .any(|field| field.to_lowercase().contains(term.as_str())),
        }
    }
}

fn parse_number(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
}

fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| AppError::invalid(field, "Expected a date formatted as YYYY-MM-DD")),
    }
}

fn non_blank(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Parses `name[ asc|desc]` tokens. Unknown names are dropped; an empty
/// result falls back to the default key, ascending.
fn parse_sort<T, K: SortKey<T>>(raw: Option<&str>) -> Vec<(K, Direction)> {
    let keys: Vec<(K, Direction)> = raw
        .unwrap_or_default()
        .split(',')
        .filter_map(|token| {
            let mut words = token.split_whitespace();
            let key = K::parse(words.next()?)?;
            let direction = match words.next() {
                Some(word) if word.eq_ignore_ascii_case("desc") => Direction::Desc,
                _ => Direction::Asc,
            };
            Some((key, direction))
        })
        .collect();

    if keys.is_empty() {
        vec![(K::DEFAULT, Direction::Asc)]
    } else {
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: i64,
        title: String,
        tags: Vec<String>,
        at: NaiveDateTime,
    }

    impl Listable for Item {
        fn search_fields(&self) -> Vec<&str> {
            vec![&self.title]
        }

        fn published_on(&self) -> NaiveDateTime {
            self.at
        }

        fn has_tag(&self, tag: &str) -> bool {
            self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum ItemSort {
        Id,
        Title,
    }

    impl SortKey<Item> for ItemSort {
        const DEFAULT: Self = ItemSort::Id;

        fn parse(name: &str) -> Option<Self> {
            match name.to_ascii_lowercase().as_str() {
                "id" => Some(Self::Id),
                "title" => Some(Self::Title),
                _ => None,
            }
        }

        fn compare(self, a: &Item, b: &Item) -> Ordering {
            match self {
                Self::Id => a.id.cmp(&b.id),
                Self::Title => a.title.cmp(&b.title),
            }
        }
    }

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn items(n: i64) -> Vec<Item> {
        (1..=n)
            .map(|id| Item {
                id,
                title: format!("Post {id:02}"),
                tags: if id % 2 == 0 { vec!["Rust".into()] } else { vec![] },
                at: day(id as u32),
            })
            .collect()
    }

    fn params(pairs: &[(&str, &str)]) -> ListParams {
        let mut p = ListParams::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "pageNumber" => p.page_number = v,
                "pageSize" => p.page_size = v,
                "searchTerm" => p.search_term = v,
                "tag" => p.tag = v,
                "startDate" => p.start_date = v,
                "endDate" => p.end_date = v,
                "orderBy" => p.order_by = v,
                _ => unreachable!(),
            }
        }
        p
    }

    fn query(pairs: &[(&str, &str)]) -> ListQuery<ItemSort> {
        params(pairs).into_query::<Item, ItemSort>(50).unwrap()
    }

    #[test]
    fn second_page_of_twelve() {
        let page = query(&[("pageNumber", "2"), ("pageSize", "5")]).run(items(12));
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.items[0].id, 6);
        assert_eq!(page.meta.total_count, 12);
        assert_eq!(page.meta.total_pages, 3);
        assert!(page.meta.has_previous);
        assert!(page.meta.has_next);
    }

    #[test]
    fn page_past_the_end_is_empty_with_metadata() {
        let page = query(&[("pageNumber", "9"), ("pageSize", "5")]).run(items(12));
        assert!(page.items.is_empty());
        assert_eq!(page.meta.total_count, 12);
        assert_eq!(page.meta.total_pages, 3);
        assert!(!page.meta.has_next);
    }

    #[test]
    fn invalid_numbers_fall_back_and_size_is_clamped() {
        let q = query(&[("pageNumber", "0"), ("pageSize", "500")]);
        assert_eq!((q.page, q.size), (1, 50));
        let q = query(&[("pageNumber", "abc"), ("pageSize", "-3")]);
        assert_eq!((q.page, q.size), (1, 1));
        let q = query(&[]);
        assert_eq!((q.page, q.size), (1, DEFAULT_PAGE_SIZE));
    }

    #[test]
    fn skip_matches_page_and_size() {
        for page in 1..=4u32 {
            for size in 1..=7u32 {
                let (page_s, size_s) = (page.to_string(), size.to_string());
                let q = query(&[("pageNumber", page_s.as_str()), ("pageSize", size_s.as_str())]);
                assert_eq!(q.skip(), ((page - 1) * size) as usize);
                assert!(q.run(items(20)).items.len() <= size as usize);
            }
        }
    }

    #[test]
    fn reversed_range_is_rejected() {
        let err = params(&[("startDate", "2024-02-01"), ("endDate", "2024-01-01")])
            .into_query::<Item, ItemSort>(50)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRange { .. }));
    }

    #[test]
    fn malformed_date_is_a_field_error() {
        let err = params(&[("startDate", "01/02/2024")])
            .into_query::<Item, ItemSort>(50)
            .unwrap_err();
        match err {
            AppError::Validation(fields) => assert_eq!(fields[0].field, "startDate"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn range_bounds_are_inclusive_days() {
        let page = query(&[("startDate", "2024-01-03"), ("endDate", "2024-01-05")]).run(items(10));
        let ids: Vec<i64> = page.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(page.meta.total_count, 3);
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let page = query(&[("searchTerm", "  post 1 ")]).run(items(12));
        let ids: Vec<i64> = page.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn blank_search_returns_everything() {
        let page = query(&[("searchTerm", "   ")]).run(items(4));
        assert_eq!(page.meta.total_count, 4);
    }

    #[test]
    fn tag_filter_ignores_case() {
        let page = query(&[("tag", "rust")]).run(items(6));
        let ids: Vec<i64> = page.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 4, 6]);
    }

    #[test]
    fn sort_tokens_skip_unknown_fields() {
        let q = query(&[("orderBy", "bogus desc, title desc")]);
        assert_eq!(q.sort, vec![(ItemSort::Title, Direction::Desc)]);
        let page = q.run(items(3));
        assert_eq!(page.items[0].id, 3);
    }

    #[test]
    fn no_valid_sort_uses_default() {
        let q = query(&[("orderBy", "nope, , nada asc")]);
        assert_eq!(q.sort, vec![(ItemSort::Id, Direction::Asc)]);
    }

    #[test]
    fn count_is_taken_before_paging() {
        let page = query(&[("tag", "rust"), ("pageSize", "1")]).run(items(10));
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.meta.total_count, 5);
        assert_eq!(page.meta.total_pages, 5);
    }
}
