//! Filter structs -> `Condition` builders, the ranked full-text clause and
//! page/sort handling shared by the customer, account and card listings.

use chrono::{DateTime, Days, NaiveDate, Utc};
use sea_orm::{
    sea_query::{Expr, Func, LikeExpr},
    ColumnTrait, Condition, ConnectionTrait, DbBackend, DbErr, EntityTrait, FromQueryResult, Order,
    PaginatorTrait, QueryFilter, QueryOrder, Select,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Inclusive creation-date window; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date_created: Option<NaiveDate>,
    pub end_date_created: Option<NaiveDate>,
}

impl DateRange {
    /// `start <= column < end + 1 day`, so the whole end day is included.
    pub fn condition<C: ColumnTrait>(&self, column: C) -> Condition {
        let mut condition = Condition::all();
        if let Some(start) = self.start_date_created {
            condition = condition.add(column.gte(start_of_day(start)));
        }
        if let Some(end) = self.end_date_created {
            match end.checked_add_days(Days::new(1)) {
                Some(next) => condition = condition.add(column.lt(start_of_day(next))),
                None => condition = condition.add(column.lte(end_of_day(end))),
            }
        }
        condition
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|| start_of_day(date))
}

/// Trimmed value of an exact-match filter; blank counts as absent.
pub fn exact(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Equality on `column` when the filter is present.
pub fn eq_if_present<C: ColumnTrait>(column: C, value: &Option<String>) -> Condition {
    match exact(value) {
        Some(v) => Condition::all().add(column.eq(v)),
        None => Condition::all(),
    }
}

/// One clause of a parsed web-search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    pub text: String,
    pub negated: bool,
}

/// Parses web-search syntax into OR-ed groups of AND-ed terms: bare words
/// are AND-ed, `"quoted phrases"` stay whole, `or` separates alternatives
/// and a leading `-` negates a term.
pub fn parse_web_search(query: &str) -> Vec<Vec<SearchTerm>> {
    let mut groups: Vec<Vec<SearchTerm>> = vec![Vec::new()];
    let mut chars = query.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut negated = false;
        if c == '-' {
            negated = true;
            chars.next();
        }

        let mut text = String::new();
        let quoted = chars.peek() == Some(&'"');
        if quoted {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                text.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                chars.next();
            }
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            continue;
        }
        if !quoted && !negated && text.eq_ignore_ascii_case("or") {
            if groups.last().map(|g| !g.is_empty()).unwrap_or(false) {
                groups.push(Vec::new());
            }
            continue;
        }
        if let Some(group) = groups.last_mut() {
            group.push(SearchTerm { text, negated });
        }
    }

    groups.retain(|g| !g.is_empty());
    groups
}

/// Applies a free-text filter. On PostgreSQL this matches the generated
/// `searchable` tsvector with `websearch_to_tsquery` and orders by rank;
/// elsewhere each term must appear (case-insensitively) in one of
/// `columns`. Blank terms leave the query untouched.
pub fn apply_full_text<E: EntityTrait>(
    select: Select<E>,
    backend: DbBackend,
    term: Option<&str>,
    columns: &[E::Column],
) -> Select<E> {
    let Some(term) = term.map(str::trim).filter(|t| !t.is_empty()) else {
        return select;
    };

    match backend {
        DbBackend::Postgres => select
            .filter(Expr::cust_with_values(
                "searchable @@ websearch_to_tsquery('simple', $1)",
                [term.to_string()],
            ))
            .order_by_desc(Expr::cust_with_values(
                "ts_rank(searchable, websearch_to_tsquery('simple', $1))",
                [term.to_string()],
            )),
        _ => select.filter(like_condition::<E>(term, columns)),
    }
}

fn like_condition<E: EntityTrait>(term: &str, columns: &[E::Column]) -> Condition {
    let mut any_group = Condition::any();
    for group in parse_web_search(term) {
        let mut all_terms = Condition::all();
        for t in group {
            let pattern = format!("%{}%", escape_like(&t.text.to_lowercase()));
            let mut in_any_column = Condition::any();
            for column in columns {
                in_any_column = in_any_column.add(
                    // NULL columns read as empty so negated terms keep the row.
                    Expr::expr(Func::lower(Func::coalesce([
                        Expr::col((E::default(), *column)).into(),
                        Expr::val("").into(),
                    ])))
                    .like(LikeExpr::new(pattern.clone()).escape('\\')),
                );
            }
            all_terms = all_terms.add(if t.negated {
                in_any_column.not()
            } else {
                in_any_column
            });
        }
        any_group = any_group.add(all_terms);
    }
    any_group
}

/// Makes `%`, `_` and `\` match literally under `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Page/size/sort query parameters (`page` is zero based).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// `field[,asc|desc]`, several separated by `;`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

impl PageRequest {
    pub fn number(&self) -> u64 {
        self.page.unwrap_or(0)
    }

    pub fn size(&self) -> u64 {
        self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    /// Sort keys, each already resolved against the caller's whitelist.
    /// Unknown fields are reported back by name.
    pub fn sort_orders<C>(
        &self,
        resolve: impl Fn(&str) -> Option<C>,
    ) -> Result<Vec<(C, Order)>, String> {
        let Some(raw) = self.sort.as_deref() else {
            return Ok(Vec::new());
        };
        let mut orders = Vec::new();
        for spec in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = spec.split(',').map(str::trim);
            let field = parts.next().unwrap_or_default();
            let column = resolve(field).ok_or_else(|| field.to_string())?;
            let order = match parts.next().map(|d| d.to_ascii_lowercase()) {
                None => Order::Asc,
                Some(d) if d == "asc" => Order::Asc,
                Some(d) if d == "desc" => Order::Desc,
                Some(_) => return Err(spec.to_string()),
            };
            orders.push((column, order));
        }
        Ok(orders)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub size: u64,
    pub number: u64,
    pub total_elements: u64,
    pub total_pages: u64,
}

impl PageMeta {
    pub fn new(number: u64, size: u64, total_elements: u64) -> Self {
        let total_pages = if size == 0 {
            0
        } else {
            total_elements.div_ceil(size)
        };
        Self {
            size,
            number,
            total_elements,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResponse<T> {
    pub content: Vec<T>,
    pub page: PageMeta,
}

impl<T> PageResponse<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PageResponse<U> {
        PageResponse {
            content: self.content.into_iter().map(f).collect(),
            page: self.page,
        }
    }
}

/// Applies explicit sort keys (after any rank ordering), a stable
/// tie-breaker, then fetches one page plus the total count.
pub async fn fetch_page<C, E, M>(
    db: &C,
    mut select: Select<E>,
    orders: Vec<(E::Column, Order)>,
    tie_breakers: &[E::Column],
    page: &PageRequest,
) -> Result<PageResponse<M>, DbErr>
where
    C: ConnectionTrait,
    E: EntityTrait<Model = M>,
    M: FromQueryResult + Sized + Send + Sync + 'static,
{
    for (column, order) in orders {
        select = select.order_by(column, order);
    }
    for column in tie_breakers {
        select = select.order_by(*column, Order::Asc);
    }

    let size = page.size();
    let number = page.number();
    let paginator = select.paginate(db, size);
    let total = paginator.num_items().await?;
    let content = paginator.fetch_page(number).await?;

    Ok(PageResponse {
        content,
        page: PageMeta::new(number, size, total),
    })
}
