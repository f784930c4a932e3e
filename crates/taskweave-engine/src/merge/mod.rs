//! Splicing completed subdivisions back into their parent template.
//!
//! Candidates are found through the subdivision tree, checked for a single
//! entry/exit shape, and classified. Preview and execution run the same
//! [`rewrite::plan`], so the committed template always matches the preview.

pub mod rewrite;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use taskweave_core::config::MergeConfig;
use taskweave_core::error::{Result, TaskweaveError};
use taskweave_core::event::EngineEvent;
use taskweave_core::template::WorkflowTemplate;
use taskweave_core::types::*;

use crate::engine::Engine;
use rewrite::{child_shape, MergeDelta, MergePlan, Step};

pub use rewrite::EdgeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    /// Overlapping regions or conditional edges at the target.
    Complex,
}

/// A completed subdivision that could replace its originating node.
#[derive(Debug, Clone, Serialize)]
pub struct MergeCandidate {
    pub subdivision_id: SubdivisionId,
    pub task_id: TaskId,
    pub instance_id: InstanceId,
    /// Template of the parent instance; the merge rewrites this version.
    pub parent_template_id: TemplateId,
    pub target_node: String,
    pub child_template_id: TemplateId,
    pub name: String,
    pub entry: Option<String>,
    pub exit: Option<String>,
    pub compatible: bool,
    /// Why the candidate is incompatible.
    pub reason: Option<String>,
    pub complexity: Complexity,
    pub notes: Vec<String>,
}

impl MergeCandidate {
    /// Only compatible candidates may be selected for a merge.
    pub fn is_selectable(&self) -> bool {
        self.compatible
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergePreview {
    pub parent_template_id: TemplateId,
    pub subdivisions: Vec<SubdivisionId>,
    pub delta: MergeDelta,
    pub complexity: Complexity,
    pub notes: Vec<String>,
    pub node_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub separator: String,
    /// Mark the parent version superseded by the merged one.
    pub supersede_original: bool,
    /// Name for the new version; defaults to the parent's name.
    pub name: Option<String>,
}

impl From<&MergeConfig> for MergeOptions {
    fn from(config: &MergeConfig) -> Self {
        Self {
            separator: config.separator.clone(),
            supersede_original: config.supersede_original,
            name: None,
        }
    }
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::from(&MergeConfig::default())
    }
}

/// Classify each compatible candidate against the others in `set`.
fn classify(parent: &WorkflowTemplate, set: &mut [MergeCandidate]) {
    let targets: Vec<(SubdivisionId, String)> = set
        .iter()
        .filter(|c| c.compatible)
        .map(|c| (c.subdivision_id.clone(), c.target_node.clone()))
        .collect();

    for candidate in set.iter_mut().filter(|c| c.compatible) {
        let target = candidate.target_node.as_str();
        let mut notes = Vec::new();

        let conditional = parent
            .edges
            .iter()
            .filter(|e| e.is_conditional() && (e.from == target || e.to == target))
            .count();
        if conditional > 0 {
            notes.push(format!(
                "{} conditional edge(s) at '{}' must be re-attached",
                conditional, target
            ));
        }

        for (other_id, other) in &targets {
            if *other_id == candidate.subdivision_id {
                continue;
            }
            if other == target {
                notes.push(format!("subdivision {} also replaces '{}'", other_id.short(), target));
            } else if parent.edges.iter().any(|e| {
                (e.from == target && e.to == *other) || (e.to == target && e.from == *other)
            }) {
                notes.push(format!("adjacent to '{}', replaced by {}", other, other_id.short()));
            }
        }

        candidate.complexity = if notes.is_empty() {
            Complexity::Simple
        } else {
            Complexity::Complex
        };
        candidate.notes = notes;
    }
}

impl Engine {
    /// Completed subdivisions of an instance, each with a compatibility
    /// verdict and a complexity classification.
    pub fn compute_merge_candidates(&self, id: &InstanceId) -> Result<Vec<MergeCandidate>> {
        let instance = self.store().get_instance(id)?;
        let parent = self.store().get_template(&instance.template_id)?;
        let tree = self.build_subdivision_tree(id, 1)?;

        let mut candidates = Vec::new();
        for child in tree.children(0) {
            let Some(link) = &child.link else { continue };
            if link.status != SubdivisionStatus::Completed {
                continue;
            }
            let child_template = self.store().get_template(&child.template_id)?;

            let verdict = match parent.get_node(&link.parent_node_key) {
                None => Err(format!(
                    "target node '{}' is not in template version {}",
                    link.parent_node_key, parent.version
                )),
                Some(node) if node.kind.is_placeholder() => {
                    Err(format!("target node '{}' is a placeholder", node.key))
                }
                Some(_) => child_shape(&child_template),
            };

            let (entry, exit, reason) = match verdict {
                Ok(shape) => (Some(shape.entry), Some(shape.exit), None),
                Err(reason) => (None, None, Some(reason)),
            };
            candidates.push(MergeCandidate {
                subdivision_id: link.subdivision_id.clone(),
                task_id: link.task_id.clone(),
                instance_id: instance.id.clone(),
                parent_template_id: parent.id.clone(),
                target_node: link.parent_node_key.clone(),
                child_template_id: child_template.id,
                name: link.name.clone(),
                entry,
                exit,
                compatible: reason.is_none(),
                reason,
                complexity: Complexity::Simple,
                notes: Vec::new(),
            });
        }

        classify(&parent, &mut candidates);
        info!(instance_id = %id, candidates = candidates.len(), "Merge candidates computed");
        Ok(candidates)
    }

    /// Node/edge changes the selected candidates would make. Nothing is
    /// written.
    pub fn preview_merge(&self, selected: &[MergeCandidate]) -> Result<MergePreview> {
        let separator = self.settings().merge.separator.clone();
        let (parent, plan, classified) = self.plan_merge(selected, &separator)?;
        Ok(preview_of(&parent, selected, plan, &classified))
    }

    /// Preview using a specific rename separator.
    pub fn preview_merge_with(
        &self,
        selected: &[MergeCandidate],
        options: &MergeOptions,
    ) -> Result<MergePreview> {
        let (parent, plan, classified) = self.plan_merge(selected, &options.separator)?;
        Ok(preview_of(&parent, selected, plan, &classified))
    }

    /// Commit the selected candidates as a new version of `parent_template_id`.
    ///
    /// The whole merge is one transaction: either the new version exists
    /// and matches the preview, or nothing was written.
    pub fn execute_merge(
        &self,
        parent_template_id: &TemplateId,
        selected: &[MergeCandidate],
        options: &MergeOptions,
    ) -> Result<TemplateId> {
        if let Some(stray) = selected
            .iter()
            .find(|c| &c.parent_template_id != parent_template_id)
        {
            return Err(TaskweaveError::Validation(format!(
                "candidate {} belongs to template {}, not {}",
                stray.subdivision_id, stray.parent_template_id, parent_template_id
            )));
        }
        for candidate in selected {
            let sub = self.store().get_subdivision(&candidate.subdivision_id)?;
            if sub.status != SubdivisionStatus::Completed {
                return Err(TaskweaveError::StateConflict(format!(
                    "subdivision {} is {}",
                    sub.id, sub.status
                )));
            }
        }

        let (parent, plan, _) = self.plan_merge(selected, &options.separator)?;
        let version = self.store().latest_version(&parent.lineage)? + 1;
        let merged = WorkflowTemplate {
            id: TemplateId::new(),
            lineage: parent.lineage.clone(),
            version,
            name: options.name.clone().unwrap_or_else(|| parent.name.clone()),
            description: parent.description.clone(),
            nodes: plan.nodes,
            edges: plan.edges,
            derived_from: Some(parent.id.clone()),
            superseded_by: None,
            created_at: Utc::now(),
        };

        let supersede = options.supersede_original.then_some(&parent.id);
        self.store().commit_merged_template(&merged, supersede)?;

        info!(
            source = %parent.id,
            template_id = %merged.id,
            version,
            added = plan.delta.added_nodes.len(),
            removed = plan.delta.removed_nodes.len(),
            "Merge committed"
        );
        self.publish(EngineEvent::TemplateMerged {
            source: parent.id.clone(),
            template_id: merged.id.clone(),
            subdivisions: selected.iter().map(|c| c.subdivision_id.clone()).collect(),
        });
        Ok(merged.id)
    }

    fn plan_merge(
        &self,
        selected: &[MergeCandidate],
        separator: &str,
    ) -> Result<(WorkflowTemplate, MergePlan, Vec<MergeCandidate>)> {
        let first = selected
            .first()
            .ok_or_else(|| TaskweaveError::Validation("no merge candidates selected".into()))?;
        if let Some(rejected) = selected.iter().find(|c| !c.is_selectable()) {
            return Err(TaskweaveError::MergeIncompatible {
                subdivision: rejected.subdivision_id.to_string(),
                reason: rejected
                    .reason
                    .clone()
                    .unwrap_or_else(|| "not selectable".into()),
            });
        }
        if selected
            .iter()
            .any(|c| c.parent_template_id != first.parent_template_id)
        {
            return Err(TaskweaveError::Validation(
                "candidates come from different templates".into(),
            ));
        }

        let parent = self.store().get_template(&first.parent_template_id)?;
        // Steps run in the parent's node order, whatever order they were selected in.
        let mut ordered: Vec<&MergeCandidate> = selected.iter().collect();
        ordered.sort_by_key(|c| {
            parent
                .nodes
                .iter()
                .position(|n| n.key == c.target_node)
                .unwrap_or(usize::MAX)
        });
        let children = ordered
            .iter()
            .map(|c| self.store().get_template(&c.child_template_id))
            .collect::<Result<Vec<_>>>()?;
        let steps: Vec<Step<'_>> = ordered
            .iter()
            .zip(&children)
            .map(|(c, child)| Step {
                subdivision: &c.subdivision_id,
                target: &c.target_node,
                child,
            })
            .collect();
        let plan = rewrite::plan(&parent, &steps, separator)?;

        let mut classified = selected.to_vec();
        classify(&parent, &mut classified);
        Ok((parent, plan, classified))
    }
}

fn preview_of(
    parent: &WorkflowTemplate,
    selected: &[MergeCandidate],
    plan: MergePlan,
    classified: &[MergeCandidate],
) -> MergePreview {
    let complexity = if classified.iter().any(|c| c.complexity == Complexity::Complex) {
        Complexity::Complex
    } else {
        Complexity::Simple
    };
    MergePreview {
        parent_template_id: parent.id.clone(),
        subdivisions: selected.iter().map(|c| c.subdivision_id.clone()).collect(),
        node_count: plan.nodes.len(),
        edge_count: plan.edges.len(),
        delta: plan.delta,
        complexity,
        notes: classified.iter().flat_map(|c| c.notes.iter().cloned()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskweave_core::template::{EdgeTemplate, NodeTemplate, WorkflowDesign};

    fn candidate(target: &str) -> MergeCandidate {
        MergeCandidate {
            subdivision_id: SubdivisionId::new(),
            task_id: TaskId::new(),
            instance_id: InstanceId::new(),
            parent_template_id: TemplateId::new(),
            target_node: target.into(),
            child_template_id: TemplateId::new(),
            name: target.into(),
            entry: Some("x".into()),
            exit: Some("y".into()),
            compatible: true,
            reason: None,
            complexity: Complexity::Simple,
            notes: Vec::new(),
        }
    }

    fn parent() -> WorkflowTemplate {
        WorkflowTemplate::from_design(
            WorkflowDesign::new("p")
                .node(NodeTemplate::human("a", "A"))
                .node(NodeTemplate::human("b", "B"))
                .node(NodeTemplate::human("c", "C"))
                .node(NodeTemplate::human("d", "D"))
                .edge("a", "b")
                .with_edge(EdgeTemplate::conditional("c", "d", "ok")),
        )
        .unwrap()
    }

    #[test]
    fn test_non_overlapping_candidates_are_simple() {
        let mut set = vec![candidate("a"), candidate("d")];
        set[1].target_node = "c".into();
        set[1].compatible = false;
        classify(&parent(), &mut set);
        assert_eq!(set[0].complexity, Complexity::Simple);
        assert!(set[0].notes.is_empty());
    }

    #[test]
    fn test_adjacent_candidates_are_complex() {
        let mut set = vec![candidate("a"), candidate("b")];
        classify(&parent(), &mut set);
        assert!(set.iter().all(|c| c.complexity == Complexity::Complex));
    }

    #[test]
    fn test_conditional_edge_makes_complex() {
        let mut set = vec![candidate("d")];
        classify(&parent(), &mut set);
        assert_eq!(set[0].complexity, Complexity::Complex);
        assert!(set[0].notes[0].contains("conditional"));
    }

    #[test]
    fn test_options_from_config() {
        let options = MergeOptions::from(&MergeConfig {
            separator: "::".into(),
            supersede_original: true,
        });
        assert_eq!(options.separator, "::");
        assert!(options.supersede_original);
        assert!(options.name.is_none());
    }
}
