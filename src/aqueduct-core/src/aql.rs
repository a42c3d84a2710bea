//! AQL query composition.
//!
//! Queries are assembled from text segments and substitution values. User
//! data is never written into the query text: it is bound under a generated
//! name (`@value0`, `@@value1`, ...) and sent alongside the query. Nested
//! queries are flattened into their parent, renumbering their generated
//! bind variables so that the result does not depend on how deeply the
//! fragments were nested.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BuilderError;

/// A query string plus the bind variables it references.
///
/// Every `@name` token has a `name` key and every `@@name` token an `@name`
/// key in [`bind_vars`](Self::bind_vars), and no key is left unused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqlQuery {
    query: String,
    #[serde(rename = "bindVars", default)]
    bind_vars: Map<String, Value>,
}

impl AqlQuery {
    /// Wrap a hand-written query, checking that text and bind variables agree.
    pub fn new(query: impl Into<String>, bind_vars: Map<String, Value>) -> Result<Self, BuilderError> {
        let query = query.into();
        validate(&query, &bind_vars)?;
        Ok(Self { query, bind_vars })
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn bind_vars(&self) -> &Map<String, Value> {
        &self.bind_vars
    }

    pub fn into_parts(self) -> (String, Map<String, Value>) {
        (self.query, self.bind_vars)
    }
}

/// Trusted text inserted into a query verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AqlLiteral(String);

impl AqlLiteral {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mark `text` as trusted query text. Never pass user input here.
pub fn literal(text: impl std::fmt::Display) -> AqlLiteral {
    AqlLiteral(text.to_string())
}

/// Anything that names a collection (or view) on the server.
pub trait CollectionRef {
    fn name(&self) -> &str;
}

/// A collection referenced by name only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionName(String);

impl CollectionRef for CollectionName {
    fn name(&self) -> &str {
        &self.0
    }
}

pub fn collection(name: impl Into<String>) -> CollectionName {
    CollectionName(name.into())
}

/// A substitution value, classified by how it enters the query.
#[derive(Debug, Clone, PartialEq)]
pub enum AqlValue {
    /// Inlined verbatim.
    Literal(String),
    /// Bound as `@@valueN`.
    Collection(String),
    /// Flattened into the parent.
    Query(AqlQuery),
    /// Bound as `@valueN`.
    Value(Value),
    /// Contributes neither text nor a binding.
    Absent,
}

impl AqlValue {
    pub fn collection(collection: &dyn CollectionRef) -> Self {
        AqlValue::Collection(collection.name().to_string())
    }

    /// Bind any serializable value.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(AqlValue::Value(serde_json::to_value(value)?))
    }
}

impl From<AqlLiteral> for AqlValue {
    fn from(literal: AqlLiteral) -> Self {
        AqlValue::Literal(literal.0)
    }
}

impl From<&AqlLiteral> for AqlValue {
    fn from(literal: &AqlLiteral) -> Self {
        AqlValue::Literal(literal.0.clone())
    }
}

impl From<AqlQuery> for AqlValue {
    fn from(query: AqlQuery) -> Self {
        AqlValue::Query(query)
    }
}

impl From<&AqlQuery> for AqlValue {
    fn from(query: &AqlQuery) -> Self {
        AqlValue::Query(query.clone())
    }
}

impl From<CollectionName> for AqlValue {
    fn from(collection: CollectionName) -> Self {
        AqlValue::Collection(collection.0)
    }
}

impl From<&CollectionName> for AqlValue {
    fn from(collection: &CollectionName) -> Self {
        AqlValue::Collection(collection.0.clone())
    }
}

impl From<Value> for AqlValue {
    fn from(value: Value) -> Self {
        AqlValue::Value(value)
    }
}

impl From<&Value> for AqlValue {
    fn from(value: &Value) -> Self {
        AqlValue::Value(value.clone())
    }
}

impl<T: Into<AqlValue>> From<Option<T>> for AqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(AqlValue::Absent)
    }
}

macro_rules! bind_scalar {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for AqlValue {
                fn from(value: $ty) -> Self {
                    AqlValue::Value(Value::from(value))
                }
            }
        )*
    };
}

bind_scalar!(&str, String, bool, i32, i64, u32, u64, f64);

/// Incremental query builder.
///
/// Errors are deferred until [`build`](Self::build) so calls can be chained.
#[derive(Debug, Default)]
pub struct AqlBuilder {
    query: String,
    bind_vars: Map<String, Value>,
    generated: Vec<(bool, Value)>,
    error: Option<BuilderError>,
}

impl AqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append query text.
    pub fn text(mut self, text: &str) -> Self {
        self.query.push_str(text);
        self
    }

    /// Append a substitution value.
    pub fn value(mut self, value: impl Into<AqlValue>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.push(value.into()) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn build(self) -> Result<AqlQuery, BuilderError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        validate(&self.query, &self.bind_vars)?;
        Ok(AqlQuery {
            query: self.query,
            bind_vars: self.bind_vars,
        })
    }

    fn push(&mut self, value: AqlValue) -> Result<(), BuilderError> {
        match value {
            AqlValue::Absent => {}
            AqlValue::Literal(text) => self.query.push_str(&text),
            AqlValue::Collection(name) => {
                let key = self.bind_generated(true, Value::String(name));
                self.push_token(&key);
            }
            AqlValue::Value(value) => {
                let key = self.bind_generated(false, value);
                self.push_token(&key);
            }
            AqlValue::Query(query) => self.merge(query)?,
        }
        Ok(())
    }

    fn push_token(&mut self, key: &str) {
        self.query.push('@');
        self.query.push_str(key);
    }

    /// Bind under a generated name, reusing the name of an equal value.
    fn bind_generated(&mut self, is_collection: bool, value: Value) -> String {
        if let Some(index) = self
            .generated
            .iter()
            .position(|(c, v)| *c == is_collection && *v == value)
        {
            return generated_key(index, is_collection);
        }

        let index = self.generated.len();
        let key = generated_key(index, is_collection);
        self.generated.push((is_collection, value.clone()));
        self.bind_vars.insert(key.clone(), value);
        key
    }

    fn merge(&mut self, nested: AqlQuery) -> Result<(), BuilderError> {
        let (text, bind_vars) = nested.into_parts();

        let mut generated: Vec<(usize, String, Value)> = Vec::new();
        let mut named: Vec<(String, Value)> = Vec::new();
        for (key, value) in bind_vars {
            match generated_index(&key) {
                Some(index) => generated.push((index, key, value)),
                None => named.push((key, value)),
            }
        }
        // Renumber in the order the fragment allocated its names
        generated.sort_by_key(|(index, _, _)| *index);

        let mut renames: HashMap<String, String> = HashMap::new();
        for (_, key, value) in generated {
            let is_collection = key.starts_with('@');
            if is_collection && !value.is_string() {
                return Err(BuilderError::InvalidCollectionName { name: key });
            }
            let renamed = self.bind_generated(is_collection, value);
            renames.insert(key, renamed);
        }

        for (key, value) in named {
            match self.bind_vars.get(&key) {
                Some(existing) if *existing != value => {
                    return Err(BuilderError::BindVarConflict { name: key });
                }
                Some(_) => {}
                None => {
                    self.bind_vars.insert(key, value);
                }
            }
        }

        let mut last = 0;
        for token in scan_bind_tokens(&text) {
            if let Some(renamed) = renames.get(&token.key()) {
                self.query.push_str(&text[last..token.start]);
                self.push_token(renamed);
                last = token.end;
            }
        }
        self.query.push_str(&text[last..]);
        Ok(())
    }
}

/// Build a query from a template: `segments` interleaved with `values`.
///
/// `segments` must hold exactly one more entry than `values`.
pub fn aql<I>(segments: &[&str], values: I) -> Result<AqlQuery, BuilderError>
where
    I: IntoIterator,
    I::Item: Into<AqlValue>,
{
    let values: Vec<AqlValue> = values.into_iter().map(Into::into).collect();
    if segments.len() != values.len() + 1 {
        return Err(BuilderError::TemplateArity {
            segments: segments.len(),
            values: values.len(),
        });
    }

    let mut builder = AqlBuilder::new().text(segments[0]);
    for (value, segment) in values.into_iter().zip(&segments[1..]) {
        builder = builder.value(value).text(segment);
    }
    builder.build()
}

/// Join fragments with a plain-text separator.
pub fn join<I>(fragments: I, separator: &str) -> Result<AqlQuery, BuilderError>
where
    I: IntoIterator,
    I::Item: Into<AqlValue>,
{
    let mut builder = AqlBuilder::new();
    for (i, fragment) in fragments.into_iter().enumerate() {
        if i > 0 {
            builder = builder.text(separator);
        }
        builder = builder.value(fragment);
    }
    builder.build()
}

fn generated_key(index: usize, is_collection: bool) -> String {
    if is_collection {
        format!("@value{index}")
    } else {
        format!("value{index}")
    }
}

/// Index of a generated key (`value3` / `@value3`), if it is one.
fn generated_index(key: &str) -> Option<usize> {
    let digits = key.strip_prefix('@').unwrap_or(key).strip_prefix("value")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A `@name` or `@@name` occurrence in query text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BindToken {
    start: usize,
    end: usize,
    name: String,
    is_collection: bool,
}

impl BindToken {
    /// The bind variable key this token refers to.
    fn key(&self) -> String {
        if self.is_collection {
            format!("@{}", self.name)
        } else {
            self.name.clone()
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Find bind parameter tokens, skipping strings, quoted names and comments.
fn scan_bind_tokens(text: &str) -> Vec<BindToken> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let end_of = |i: usize| chars.get(i).map(|(pos, _)| *pos).unwrap_or(text.len());
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            '\'' | '"' => {
                i += 1;
                while i < chars.len() && chars[i].1 != c {
                    if chars[i].1 == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            '`' | '´' => {
                i += 1;
                while i < chars.len() && chars[i].1 != c {
                    i += 1;
                }
                i += 1;
            }
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i].1 != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i].1 == '*' && chars.get(i + 1).map(|(_, c)| *c) == Some('/')) {
                    i += 1;
                }
                i += 2;
            }
            '@' => {
                let start = chars[i].0;
                let is_collection = next == Some('@');
                let mut j = if is_collection { i + 2 } else { i + 1 };
                let name_start = j;
                while j < chars.len() && is_name_char(chars[j].1) {
                    j += 1;
                }
                if j > name_start {
                    tokens.push(BindToken {
                        start,
                        end: end_of(j),
                        name: text[end_of(name_start)..end_of(j)].to_string(),
                        is_collection,
                    });
                }
                i = j.max(i + 1);
            }
            _ => i += 1,
        }
    }

    tokens
}

fn validate(query: &str, bind_vars: &Map<String, Value>) -> Result<(), BuilderError> {
    let used: BTreeSet<String> = scan_bind_tokens(query).iter().map(BindToken::key).collect();

    if let Some(name) = used.iter().find(|key| !bind_vars.contains_key(*key)) {
        return Err(BuilderError::UnboundParameter { name: name.clone() });
    }
    if let Some(name) = bind_vars.keys().find(|key| !used.contains(*key)) {
        return Err(BuilderError::UnusedBindVar { name: name.clone() });
    }
    if let Some((name, _)) = bind_vars
        .iter()
        .find(|(key, value)| key.starts_with('@') && !value.is_string())
    {
        return Err(BuilderError::InvalidCollectionName { name: name.clone() });
    }
    Ok(())
}
