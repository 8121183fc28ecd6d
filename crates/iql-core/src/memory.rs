//! In-process session over a small document store.
//!
//! Evaluates pushed instructions per document with the same left-to-right stack discipline a
//! remote engine uses, keeps one column of per-document values per evaluation stack slot, and
//! serves regroups and sorted term streams from them. Fields are single valued.
use crate::config::EngineConfig;
use crate::engine::{IqlError, IqlResult};
use crate::key::{Field, FieldKind, GroupKeyMap, Term};
use crate::reference::{DynamicMetric, MetricRegistry, StatStack};
use crate::session::{FtgsRecord, FtgsStream, Session};
use crate::stats::{Stat, StatOp, Token};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    fields: HashMap<String, Term>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_int(mut self, field: impl Into<String>, value: i64) -> Self {
        self.fields.insert(field.into(), Term::Int(value));
        self
    }

    pub fn with_str(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), Term::Str(value.into()));
        self
    }

    pub fn get(&self, field: &str) -> Option<&Term> {
        self.fields.get(field)
    }

    /// The document's term for `field` as seen through the field's kind. Integer views accept
    /// numeric strings; string views only see strings.
    fn term(&self, field: &Field) -> Option<Term> {
        let term = self.fields.get(field.name())?;
        match field.kind() {
            FieldKind::Int => term.as_int().map(Term::Int),
            FieldKind::Str => match term {
                Term::Str(_) => Some(term.clone()),
                Term::Int(_) => None,
            },
        }
    }

    fn int_value(&self, field: &str) -> i64 {
        self.fields.get(field).and_then(Term::as_int).unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct InMemorySession {
    docs: Vec<Document>,
    doc_groups: Vec<u32>,
    group_count: usize,
    /// Per-document values of each evaluation stack slot, bottom first.
    columns: Vec<Vec<i64>>,
    stack: StatStack,
    metrics: MetricRegistry,
    dynamic_values: HashMap<String, Vec<i64>>,
    group_limit: usize,
    fail_stream_after: Option<usize>,
}

impl InMemorySession {
    /// Every document starts in group 1.
    pub fn new(docs: Vec<Document>, config: &EngineConfig) -> Self {
        let doc_groups = vec![1; docs.len()];
        Self {
            docs,
            doc_groups,
            group_count: 2,
            columns: Vec::new(),
            stack: StatStack::new(),
            metrics: MetricRegistry::new(),
            dynamic_values: HashMap::new(),
            group_limit: config.group_limit,
            fail_stream_after: None,
        }
    }

    /// Abort every term stream with an error after `records` records.
    pub fn fail_stream_after(mut self, records: usize) -> Self {
        self.fail_stream_after = Some(records);
        self
    }

    /// Place documents into explicit groups (0 drops a document).
    pub fn assign_groups(&mut self, doc_groups: Vec<u32>) -> IqlResult<()> {
        if doc_groups.len() != self.docs.len() {
            return Err(IqlError::Session(format!(
                "expected {} group assignments, got {}",
                self.docs.len(),
                doc_groups.len()
            )));
        }
        self.group_count = doc_groups.iter().copied().max().unwrap_or(0) as usize + 1;
        self.doc_groups = doc_groups;
        Ok(())
    }

    pub fn doc_groups(&self) -> &[u32] {
        &self.doc_groups
    }

    /// Register a dynamic metric with one value per document.
    pub fn register_metric(&mut self, name: &str, values: Vec<i64>) -> IqlResult<DynamicMetric> {
        if values.len() != self.docs.len() {
            return Err(IqlError::Session(format!(
                "dynamic metric {name} has {} values for {} documents",
                values.len(),
                self.docs.len()
            )));
        }
        self.dynamic_values.insert(name.to_string(), values);
        Ok(self.metrics.register(name))
    }

    pub fn metrics_mut(&mut self) -> &mut MetricRegistry {
        &mut self.metrics
    }

    fn eval_doc(&self, doc_idx: usize, tokens: &[Token], stack: &mut Vec<i64>) -> IqlResult<()> {
        let doc = &self.docs[doc_idx];
        let base = self.columns.len();
        stack.clear();
        for token in tokens {
            let value = match token {
                Token::Field(name) => doc.int_value(name),
                Token::Literal(v) => *v,
                Token::Operator(op) => {
                    let right = stack.pop().ok_or(IqlError::StackUnderflow)?;
                    let left = stack.pop().ok_or(IqlError::StackUnderflow)?;
                    apply(*op, left, right)
                }
                Token::Exp => {
                    let v = stack.pop().ok_or(IqlError::StackUnderflow)?;
                    let e = (v as f64).exp();
                    if e >= i64::MAX as f64 {
                        i64::MAX
                    } else {
                        e as i64
                    }
                }
                Token::Abs => stack.pop().ok_or(IqlError::StackUnderflow)?.saturating_abs(),
                Token::Cached => continue,
                Token::HasInt { field, value } => {
                    i64::from(doc.get(field).and_then(Term::as_int) == Some(*value))
                }
                Token::HasStr { field, value } => {
                    i64::from(doc.get(field).map(Term::to_string).as_deref() == Some(value.as_str()))
                }
                Token::Ref(offset) => {
                    let slot = base
                        .checked_sub(offset + 1)
                        .ok_or(IqlError::UnknownReference { offset: *offset })?;
                    self.columns[slot][doc_idx]
                }
                Token::Count => 1,
                Token::FloatScale { field, mult, add } => {
                    let raw = match doc.get(field) {
                        Some(Term::Int(v)) => *v as f64,
                        Some(Term::Str(s)) => s.trim().parse::<f64>().unwrap_or_else(|_| {
                            log::trace!("floatscale: {field}={s:?} is not a number; reading 0");
                            0.0
                        }),
                        None => 0.0,
                    };
                    (raw * *mult as f64 + *add as f64) as i64
                }
                Token::Dynamic(name) => self
                    .dynamic_values
                    .get(name)
                    .and_then(|values| values.get(doc_idx).copied())
                    .unwrap_or(0),
            };
            stack.push(value);
        }
        Ok(())
    }

    /// Sum of each slot's values per (term, group) for one field, in term then group order.
    fn term_group_sums(&self, field: &Field, slots: &[usize]) -> BTreeMap<(Term, u32), Vec<f64>> {
        let mut sums: BTreeMap<(Term, u32), Vec<f64>> = BTreeMap::new();
        for (doc_idx, doc) in self.docs.iter().enumerate() {
            let group = self.doc_groups[doc_idx];
            if group == 0 {
                continue;
            }
            let Some(term) = doc.term(field) else {
                continue;
            };
            let entry = sums
                .entry((term, group))
                .or_insert_with(|| vec![0.0; slots.len()]);
            for (acc, slot) in entry.iter_mut().zip(slots) {
                *acc += self.columns[*slot][doc_idx] as f64;
            }
        }
        sums
    }

    /// Move every document of a parent group into the child assigned to its term; documents
    /// whose (group, term) has no child drop to group 0.
    fn remap(&mut self, field: &Field, children: &HashMap<(u32, Term), u32>, group_count: usize) {
        for (doc_idx, doc) in self.docs.iter().enumerate() {
            let group = self.doc_groups[doc_idx];
            self.doc_groups[doc_idx] = doc
                .term(field)
                .and_then(|term| children.get(&(group, term)).copied())
                .unwrap_or(0);
        }
        self.group_count = group_count;
    }

    /// Assign child ids in parent order, then in the given term order.
    fn split(
        &mut self,
        field: &Field,
        group_keys: &GroupKeyMap,
        terms_per_group: BTreeMap<u32, Vec<Term>>,
    ) -> IqlResult<GroupKeyMap> {
        let total: usize = terms_per_group.values().map(Vec::len).sum();
        if total + 1 > self.group_limit {
            return Err(IqlError::GroupLimitExceeded {
                groups: total,
                limit: self.group_limit,
            });
        }

        let mut children = HashMap::with_capacity(total);
        let mut out = GroupKeyMap::new();
        let mut next: u32 = 1;
        for (group, parent) in group_keys {
            for term in terms_per_group.get(group).into_iter().flatten() {
                children.insert((*group, term.clone()), next);
                out.insert(next, parent.add(term.clone()));
                next += 1;
            }
        }
        self.remap(field, &children, next as usize);
        log::debug!("split {field} into {} group(s)", out.len());
        Ok(out)
    }
}

fn apply(op: StatOp, left: i64, right: i64) -> i64 {
    match op {
        StatOp::Add => left.wrapping_add(right),
        StatOp::Subtract => left.wrapping_sub(right),
        StatOp::Multiply => left.wrapping_mul(right),
        StatOp::Divide => left.checked_div(right).unwrap_or(0),
        StatOp::Modulus => left.checked_rem(right).unwrap_or(0),
        StatOp::Less => i64::from(left < right),
        StatOp::LessEquals => i64::from(left <= right),
        StatOp::Greater => i64::from(left > right),
        StatOp::GreaterEquals => i64::from(left >= right),
        StatOp::Equals => i64::from(left == right),
        StatOp::NotEquals => i64::from(left != right),
        StatOp::Min => left.min(right),
        StatOp::Max => left.max(right),
    }
}

impl Session for InMemorySession {
    fn stat_stack(&self) -> &StatStack {
        &self.stack
    }

    fn stat_stack_mut(&mut self) -> &mut StatStack {
        &mut self.stack
    }

    fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    fn load_stat(&mut self, tokens: &[Token], width: usize) -> IqlResult<()> {
        let mut new_columns = vec![Vec::with_capacity(self.docs.len()); width];
        let mut stack = Vec::new();
        for doc_idx in 0..self.docs.len() {
            self.eval_doc(doc_idx, tokens, &mut stack)?;
            if stack.len() != width {
                return Err(IqlError::Session(format!(
                    "instructions left {} values, expected {width}",
                    stack.len()
                )));
            }
            for (column, value) in new_columns.iter_mut().zip(stack.iter()) {
                column.push(*value);
            }
        }
        self.columns.extend(new_columns);
        Ok(())
    }

    fn unload_stat(&mut self, width: usize) -> IqlResult<()> {
        if width > self.columns.len() {
            return Err(IqlError::StackUnderflow);
        }
        self.columns.truncate(self.columns.len() - width);
        Ok(())
    }

    fn group_count(&self) -> usize {
        self.group_count
    }

    fn split_all(&mut self, field: &Field, group_keys: &GroupKeyMap) -> IqlResult<GroupKeyMap> {
        log::debug!("passthrough split on {field}");
        for group in self.doc_groups.iter_mut() {
            if !group_keys.contains_key(group) {
                *group = 0;
            }
        }
        Ok(group_keys.clone())
    }

    fn split_all_top_k(
        &mut self,
        field: &Field,
        group_keys: &GroupKeyMap,
        k: usize,
        sort_stat: &Stat,
        bottom: bool,
    ) -> IqlResult<GroupKeyMap> {
        let sort_ref = self.push_stat(sort_stat)?;
        let slots: Vec<usize> = (0..self.columns.len()).collect();
        let sums = self.term_group_sums(field, &slots);
        self.pop_stat()?;

        let mut ranked: BTreeMap<u32, Vec<(f64, Term)>> = BTreeMap::new();
        for ((term, group), stats) in sums {
            if group_keys.contains_key(&group) {
                ranked
                    .entry(group)
                    .or_default()
                    .push((sort_ref.read(&stats), term));
            }
        }

        let terms_per_group = ranked
            .into_iter()
            .map(|(group, mut terms)| {
                // Stable sort keeps term order among equal scores.
                terms.sort_by(|a, b| {
                    let ord = a.0.total_cmp(&b.0);
                    if bottom {
                        ord
                    } else {
                        ord.reverse()
                    }
                });
                terms.truncate(k);
                (group, terms.into_iter().map(|(_, term)| term).collect())
            })
            .collect();

        self.split(field, group_keys, terms_per_group)
    }

    fn split_all_explode(&mut self, field: &Field, group_keys: &GroupKeyMap) -> IqlResult<GroupKeyMap> {
        let mut terms: BTreeMap<u32, BTreeSet<Term>> = BTreeMap::new();
        for (doc_idx, doc) in self.docs.iter().enumerate() {
            let group = self.doc_groups[doc_idx];
            if !group_keys.contains_key(&group) {
                continue;
            }
            if let Some(term) = doc.term(field) {
                terms.entry(group).or_default().insert(term);
            }
        }
        let terms_per_group = terms
            .into_iter()
            .map(|(group, set)| (group, set.into_iter().collect()))
            .collect();
        self.split(field, group_keys, terms_per_group)
    }

    fn iterate_sorted_terms(&mut self, fields: &[Field]) -> IqlResult<FtgsStream<'_>> {
        let slots: Vec<usize> = (0..self.columns.len()).collect();
        let mut records = Vec::new();
        for field in fields {
            let name: Arc<str> = Arc::from(field.name());
            for ((term, group), stats) in self.term_group_sums(field, &slots) {
                records.push(FtgsRecord {
                    field: name.clone(),
                    term,
                    group,
                    stats,
                });
            }
        }
        log::trace!("term stream of {} record(s) over {} field(s)", records.len(), fields.len());

        match self.fail_stream_after {
            Some(limit) => {
                let field = fields.first().map(|f| f.name().to_string()).unwrap_or_default();
                let abort = IqlError::StreamAborted {
                    field,
                    reason: format!("stream interrupted after {limit} records"),
                };
                Ok(Box::new(
                    records
                        .into_iter()
                        .take(limit)
                        .map(Ok)
                        .chain(std::iter::once(Err(abort))),
                ))
            }
            None => Ok(Box::new(records.into_iter().map(Ok))),
        }
    }

    fn slot_group_stats(&mut self, depth: usize) -> IqlResult<Vec<f64>> {
        let column = self
            .columns
            .get(depth)
            .ok_or(IqlError::UnknownReference { offset: depth })?;
        let mut totals = vec![0.0; self.group_count];
        for (doc_idx, value) in column.iter().enumerate() {
            let group = self.doc_groups[doc_idx] as usize;
            if group != 0 && group < totals.len() {
                totals[group] += *value as f64;
            }
        }
        Ok(totals)
    }
}
