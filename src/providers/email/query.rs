//! Search query translation.
//!
//! Task queries use Gmail's search syntax. [`parse_query`] turns a query into
//! typed clauses; [`to_gmail_query`] renders it back for the Gmail API and
//! [`to_graph_filter`] maps it onto Microsoft Graph's OData `$filter`.
//!
//! Translation is lenient: anything a backend cannot express is reported in
//! [`GraphQuery::unsupported`] instead of failing the whole query.

use chrono::{DateTime, Duration, Months, Utc};

/// Message state matched by `is:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Unread,
    Read,
    Starred,
    Important,
}

/// Time unit in `older_than:` / `newer_than:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeUnit {
    Day,
    Month,
    Year,
}

/// A relative age such as `30d` or `2y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeAge {
    pub amount: u32,
    pub unit: AgeUnit,
}

impl RelativeAge {
    fn parse(value: &str) -> Option<Self> {
        let unit = match value.chars().last()?.to_ascii_lowercase() {
            'd' => AgeUnit::Day,
            'm' => AgeUnit::Month,
            'y' => AgeUnit::Year,
            _ => return None,
        };
        let amount = value[..value.len() - 1].parse().ok()?;
        Some(Self { amount, unit })
    }

    /// The instant `self` before `now`.
    pub fn before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let shifted = match self.unit {
            AgeUnit::Day => now.checked_sub_signed(Duration::days(i64::from(self.amount))),
            AgeUnit::Month => now.checked_sub_months(Months::new(self.amount)),
            AgeUnit::Year => now.checked_sub_months(Months::new(self.amount.saturating_mul(12))),
        };
        shifted.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn render(&self) -> String {
        let unit = match self.unit {
            AgeUnit::Day => 'd',
            AgeUnit::Month => 'm',
            AgeUnit::Year => 'y',
        };
        format!("{}{}", self.amount, unit)
    }
}

/// One search criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    From(String),
    To(String),
    Subject(String),
    Is(MessageState),
    HasAttachment,
    OlderThan(RelativeAge),
    NewerThan(RelativeAge),
    In(String),
    Label(String),
    Category(String),
    /// Size threshold as written, e.g. `5M`.
    Larger(String),
    /// Free word or quoted phrase.
    Text(String),
    /// A fragment this module does not understand, kept verbatim.
    Raw(String),
}

/// A term with optional `-` negation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub negated: bool,
    pub term: Term,
}

/// A parsed query. Clauses are implicitly AND-ed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    pub clauses: Vec<Clause>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Splits on whitespace, keeping double-quoted runs together. Quotes are
/// preserved in the token.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}

fn parse_term(token: &str) -> Term {
    if token.starts_with('"') {
        return Term::Text(unquote(token));
    }

    let Some((field, value)) = token.split_once(':') else {
        return match token {
            "OR" | "AND" => Term::Raw(token.to_string()),
            t if t.starts_with('(') || t.ends_with(')') || t.starts_with('{') => {
                Term::Raw(token.to_string())
            }
            _ => Term::Text(token.to_string()),
        };
    };
    let value = unquote(value);
    if value.is_empty() {
        return Term::Raw(token.to_string());
    }

    match field.to_ascii_lowercase().as_str() {
        "from" => Term::From(value),
        "to" => Term::To(value),
        "subject" => Term::Subject(value),
        "is" => match value.to_ascii_lowercase().as_str() {
            "unread" => Term::Is(MessageState::Unread),
            "read" => Term::Is(MessageState::Read),
            "starred" => Term::Is(MessageState::Starred),
            "important" => Term::Is(MessageState::Important),
            _ => Term::Raw(token.to_string()),
        },
        "has" if value.eq_ignore_ascii_case("attachment") => Term::HasAttachment,
        "older_than" | "newer_than" => match RelativeAge::parse(&value) {
            Some(age) if field.eq_ignore_ascii_case("older_than") => Term::OlderThan(age),
            Some(age) => Term::NewerThan(age),
            None => Term::Raw(token.to_string()),
        },
        "in" => Term::In(value.to_ascii_lowercase()),
        "label" => Term::Label(value),
        "category" => Term::Category(value.to_ascii_lowercase()),
        "larger" => Term::Larger(value),
        _ => Term::Raw(token.to_string()),
    }
}

/// Parses Gmail-style search syntax. Never fails.
pub fn parse_query(input: &str) -> ParsedQuery {
    let clauses = tokenize(input)
        .into_iter()
        .filter_map(|token| {
            let (negated, body) = match token.strip_prefix('-') {
                Some(rest) if !rest.is_empty() => (true, rest.to_string()),
                _ => (false, token),
            };
            if body == "-" {
                return None;
            }
            Some(Clause {
                negated,
                term: parse_term(&body),
            })
        })
        .collect();
    ParsedQuery { clauses }
}

fn quote_if_needed(value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

fn render_gmail_term(term: &Term) -> String {
    match term {
        Term::From(v) => format!("from:{}", quote_if_needed(v)),
        Term::To(v) => format!("to:{}", quote_if_needed(v)),
        Term::Subject(v) => format!("subject:{}", quote_if_needed(v)),
        Term::Is(state) => match state {
            MessageState::Unread => "is:unread".to_string(),
            MessageState::Read => "is:read".to_string(),
            MessageState::Starred => "is:starred".to_string(),
            MessageState::Important => "is:important".to_string(),
        },
        Term::HasAttachment => "has:attachment".to_string(),
        Term::OlderThan(age) => format!("older_than:{}", age.render()),
        Term::NewerThan(age) => format!("newer_than:{}", age.render()),
        Term::In(v) => format!("in:{}", quote_if_needed(v)),
        Term::Label(v) => format!("label:{}", quote_if_needed(v)),
        Term::Category(v) => format!("category:{v}"),
        Term::Larger(v) => format!("larger:{v}"),
        Term::Text(v) => quote_if_needed(v),
        Term::Raw(v) => v.clone(),
    }
}

/// Renders a parsed query in Gmail's native syntax.
pub fn to_gmail_query(query: &ParsedQuery) -> String {
    query
        .clauses
        .iter()
        .map(|clause| {
            let term = render_gmail_term(&clause.term);
            if clause.negated {
                format!("-{term}")
            } else {
                term
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Folder a Graph query is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphFolder {
    /// A Graph well-known folder name such as `inbox` or `deleteditems`.
    WellKnown(&'static str),
    /// A user folder, resolved by display name.
    Named(String),
}

/// A query translated for Microsoft Graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphQuery {
    /// OData `$filter` expression, if any clause translated.
    pub filter: Option<String>,
    /// Folder to search in. `None` searches all messages.
    pub folder: Option<GraphFolder>,
    /// Fragments with no Graph equivalent, as written in the query.
    pub unsupported: Vec<String>,
}

/// Maps Gmail system folder names onto Graph well-known folders.
pub fn well_known_folder(name: &str) -> Option<GraphFolder> {
    let folder = match name.to_ascii_lowercase().as_str() {
        "inbox" => "inbox",
        "sent" => "sentitems",
        "drafts" | "draft" => "drafts",
        "trash" | "bin" => "deleteditems",
        "spam" | "junk" => "junkemail",
        "archive" => "archive",
        _ => return None,
    };
    Some(GraphFolder::WellKnown(folder))
}

fn odata_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn graph_expr(term: &Term, now: DateTime<Utc>) -> Option<String> {
    let expr = match term {
        Term::From(v) if v.contains('@') => {
            format!("from/emailAddress/address eq {}", odata_string(v))
        }
        Term::From(v) => format!("contains(from/emailAddress/address,{})", odata_string(v)),
        Term::To(v) if v.contains('@') => format!(
            "toRecipients/any(r:r/emailAddress/address eq {})",
            odata_string(v)
        ),
        Term::Subject(v) | Term::Text(v) => format!("contains(subject,{})", odata_string(v)),
        Term::Is(MessageState::Unread) => "isRead eq false".to_string(),
        Term::Is(MessageState::Read) => "isRead eq true".to_string(),
        Term::Is(MessageState::Starred) => "flag/flagStatus eq 'flagged'".to_string(),
        Term::Is(MessageState::Important) => "importance eq 'high'".to_string(),
        Term::HasAttachment => "hasAttachments eq true".to_string(),
        Term::OlderThan(age) => format!(
            "receivedDateTime lt {}",
            age.before(now).format("%Y-%m-%dT%H:%M:%SZ")
        ),
        Term::NewerThan(age) => format!(
            "receivedDateTime ge {}",
            age.before(now).format("%Y-%m-%dT%H:%M:%SZ")
        ),
        Term::Category(c) if c == "primary" => "inferenceClassification eq 'focused'".to_string(),
        Term::Category(c)
            if matches!(c.as_str(), "promotions" | "social" | "updates" | "forums") =>
        {
            "inferenceClassification eq 'other'".to_string()
        }
        _ => return None,
    };
    Some(expr)
}

fn written(clause: &Clause) -> String {
    if clause.negated {
        format!("-{}", render_gmail_term(&clause.term))
    } else {
        render_gmail_term(&clause.term)
    }
}

fn is_or(clause: &Clause) -> bool {
    !clause.negated && clause.term == Term::Raw("OR".to_string())
}

/// Splits clauses into AND-ed groups whose members are joined by `OR`.
/// A leading or trailing `OR` stays a group of its own.
fn disjunctions(clauses: &[Clause]) -> Vec<Vec<&Clause>> {
    let mut groups: Vec<Vec<&Clause>> = Vec::new();
    let mut joining = false;
    for (i, clause) in clauses.iter().enumerate() {
        let has_next = i + 1 < clauses.len();
        let has_prev = groups.last().is_some();
        if is_or(clause) && has_next && has_prev {
            joining = true;
            continue;
        }
        match groups.last_mut() {
            Some(group) if joining => group.push(clause),
            _ => groups.push(vec![clause]),
        }
        joining = false;
    }
    groups
}

fn clause_expr(clause: &Clause, now: DateTime<Utc>) -> Option<String> {
    let expr = graph_expr(&clause.term, now)?;
    Some(if clause.negated {
        format!("not ({expr})")
    } else {
        expr
    })
}

/// Translates a parsed query into a Graph `$filter` plus folder scope.
///
/// `now` anchors relative ages. The first positive `in:` or `label:` clause
/// picks the folder; any further folder clause is unsupported. Clauses
/// joined by `OR` become one parenthesized `or` expression; if any member of
/// such a group cannot be expressed, the whole group is unsupported and
/// dropped from the filter.
pub fn to_graph_filter(query: &ParsedQuery, now: DateTime<Utc>) -> GraphQuery {
    let mut result = GraphQuery::default();
    let mut exprs = Vec::new();

    for group in disjunctions(&query.clauses) {
        if let [clause] = group.as_slice() {
            translate_single(clause, now, &mut result, &mut exprs);
            continue;
        }
        let members: Option<Vec<String>> =
            group.iter().map(|clause| clause_expr(clause, now)).collect();
        match members {
            Some(members) => exprs.push(format!("({})", members.join(" or "))),
            None => result.unsupported.push(
                group
                    .iter()
                    .map(|clause| written(clause))
                    .collect::<Vec<_>>()
                    .join(" OR "),
            ),
        }
    }

    if !exprs.is_empty() {
        result.filter = Some(exprs.join(" and "));
    }
    result
}

fn translate_single(
    clause: &Clause,
    now: DateTime<Utc>,
    result: &mut GraphQuery,
    exprs: &mut Vec<String>,
) {
    let folder = match &clause.term {
        Term::In(name) if matches!(name.as_str(), "anywhere" | "all") => {
            if clause.negated {
                result.unsupported.push(written(clause));
            }
            return;
        }
        Term::In(name) => Some(well_known_folder(name)),
        Term::Label(name) => Some(
            well_known_folder(name).or_else(|| Some(GraphFolder::Named(name.clone()))),
        ),
        _ => None,
    };
    if let Some(folder) = folder {
        match folder {
            Some(folder) if !clause.negated && result.folder.is_none() => {
                result.folder = Some(folder);
            }
            _ => result.unsupported.push(written(clause)),
        }
        return;
    }

    match clause_expr(clause, now) {
        Some(expr) => exprs.push(expr),
        None => result.unsupported.push(written(clause)),
    }
}
