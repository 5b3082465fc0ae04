//! conductor-rules
//!
//! Closure over a small state-transition graph: given a set of rules
//! `(sources, target, action)`, answer "what action moves us one step closer
//! from state A to state B" for any reachable pair.
//!
//! Deterministic, pure logic. No IO.

use std::collections::HashMap;
use std::hash::Hash;

/// One transition rule: from any state in `sources`, `action` leads toward
/// `target` (not necessarily directly, but the action associated with the
/// first hop of a least-hop path).
#[derive(Clone, Debug)]
pub struct Rule<S, A> {
    pub sources: Vec<S>,
    pub target: S,
    pub action: A,
}

impl<S, A> Rule<S, A> {
    pub fn new(sources: Vec<S>, target: S, action: A) -> Self {
        Self {
            sources,
            target,
            action,
        }
    }
}

/// For one target state, the best known (rule index, hop count) to reach it
/// from each source state seen so far.
type RouteTable<S> = HashMap<S, HashMap<S, (usize, u32)>>;

/// All-pairs least-hop closure over a rule set.
///
/// Construction computes, for every target `t` and every reachable source
/// `s`, a least-hop `(rule, cost)` pair by iterated two-step relaxation until
/// no entry improves. The state alphabet this is built for is tiny (8 nodes
/// for instance lifecycle), so the O(|states|^3)-ish relaxation is
/// negligible.
pub struct RuleEngine<S, A> {
    rules: Vec<Rule<S, A>>,
    matrix: RouteTable<S>,
}

impl<S, A> RuleEngine<S, A>
where
    S: Eq + Hash + Clone,
    A: Clone,
{
    /// Build the engine from a rule set. Rule order matters for
    /// tie-breaking: when two rules reach the same (source, target) pair at
    /// equal cost, the rule discovered first (i.e. appearing earlier in
    /// `rules`, or reachable through an earlier-discovered intermediate)
    /// wins. Callers must preserve insertion order of `rules` to keep this
    /// deterministic.
    pub fn new(rules: Vec<Rule<S, A>>) -> Self {
        let mut matrix: RouteTable<S> = HashMap::new();

        for (idx, rule) in rules.iter().enumerate() {
            let by_source = matrix.entry(rule.target.clone()).or_default();
            for s in &rule.sources {
                // Only the first rule that reaches (s, target) is recorded;
                // later rules for the same pair are ignored here exactly as
                // the python construction does (`if not s in matrix[t]`).
                by_source.entry(s.clone()).or_insert((idx, 1));
            }
        }

        let mut engine = Self { rules, matrix };
        engine.close();
        engine
    }

    /// Collect every currently known (source, target, rule_idx, cost) route.
    fn all_routes(&self) -> Vec<(S, S, usize, u32)> {
        let mut out = Vec::new();
        for (target, by_source) in &self.matrix {
            for (source, (rule_idx, cost)) in by_source {
                out.push((source.clone(), target.clone(), *rule_idx, *cost));
            }
        }
        out
    }

    /// Every known route whose target is `to`.
    fn all_routes_to(&self, to: &S) -> Vec<(S, usize, u32)> {
        self.matrix
            .get(to)
            .map(|by_source| {
                by_source
                    .iter()
                    .map(|(s, (r, c))| (s.clone(), *r, *c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Relax two-step paths (source -> intermediate -> target) into the
    /// matrix until a full pass makes no improvement.
    fn close(&mut self) {
        loop {
            let mut changed = false;
            // Every known route `intermediate -> target` at cost `cost2`...
            for (intermediate, target, _rule2, cost2) in self.all_routes() {
                // ...composed with every known route `source -> intermediate`
                // at cost `cost1` gives a candidate `source -> target`.
                for (source, rule1, cost1) in self.all_routes_to(&intermediate) {
                    if source == target {
                        continue;
                    }
                    let candidate_cost = cost1 + cost2;
                    let by_source = self.matrix.entry(target.clone()).or_default();
                    let improves = match by_source.get(&source) {
                        None => true,
                        Some((_, existing_cost)) => *existing_cost > candidate_cost,
                    };
                    if improves {
                        by_source.insert(source.clone(), (rule1, candidate_cost));
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// The rule whose action sits on the first hop of a least-hop path from
    /// `from` to `to`, or `None` if `to` is unreachable from `from`.
    pub fn pick_rule(&self, from: &S, to: &S) -> Option<&Rule<S, A>> {
        self.matrix
            .get(to)
            .and_then(|by_source| by_source.get(from))
            .map(|(rule_idx, _cost)| &self.rules[*rule_idx])
    }

    /// Returns the action of the first rule on a least-cost path from `from`
    /// to `to`; `None` if unreachable. Callers handle the `from == to`
    /// trivial case themselves.
    pub fn plan(&self, from: &S, to: &S) -> Option<A> {
        self.pick_rule(from, to).map(|rule| rule.action.clone())
    }
}
