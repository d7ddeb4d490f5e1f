use std::collections::HashMap;

use crate::{flag::Target, EvaluationContext, FlagEntry, Snapshot};

impl Snapshot {
    /// Evaluate `slug` for `context`. Returns `fallback_if_missing` when the snapshot has no such
    /// flag.
    pub fn is_enabled(
        &self,
        slug: &str,
        context: Option<&EvaluationContext>,
        fallback_if_missing: bool,
    ) -> bool {
        match self.get(slug) {
            Some(flag) => flag.eval(context),
            None => fallback_if_missing,
        }
    }

    /// Evaluate every flag in the snapshot for `context`.
    pub fn eval_all(&self, context: Option<&EvaluationContext>) -> HashMap<String, bool> {
        self.flags()
            .iter()
            .map(|(slug, flag)| (slug.clone(), flag.eval(context)))
            .collect()
    }
}

impl FlagEntry {
    /// Resolve this flag for `context`.
    ///
    /// A matching user target wins over a matching organization target, which wins over the
    /// top-level `enabled` state. `default_value` does not take part in evaluation.
    pub fn eval(&self, context: Option<&EvaluationContext>) -> bool {
        let Some(context) = context else {
            return self.enabled;
        };

        if let Some(target) = find_target(&self.targets.users, context.user_id.as_deref()) {
            return target.enabled;
        }

        if let Some(target) = find_target(
            &self.targets.organizations,
            context.organization_id.as_deref(),
        ) {
            return target.enabled;
        }

        self.enabled
    }
}

fn find_target<'a>(targets: &'a [Target], id: Option<&str>) -> Option<&'a Target> {
    let id = id?;
    targets.iter().find(|target| target.id == id)
}
