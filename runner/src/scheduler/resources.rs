use crate::job::{JobRequest, DEFAULT_ELAPSE};
use itertools::Itertools;

/// Resources requested from the scheduler, only populated fields end up on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    pub node: Option<u32>,
    pub vnode_core: Option<u32>,
    pub gpu: Option<u32>,
    pub elapse: Option<String>,
}

impl From<&JobRequest> for ResourceSpec {
    fn from(request: &JobRequest) -> Self {
        Self {
            node: request.node,
            vnode_core: request.vnode_core,
            gpu: request.gpu,
            elapse: Some(
                request
                    .elapse
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ELAPSE.to_owned()),
            ),
        }
    }
}

impl ResourceSpec {
    /// `key=value` clauses in node, vnode-core, gpu, elapse order
    pub fn clauses(&self) -> Vec<String> {
        let counts = [
            ("node", self.node),
            ("vnode-core", self.vnode_core),
            ("gpu", self.gpu),
        ];

        counts
            .into_iter()
            .filter_map(|(key, value)| match value {
                Some(count) if count > 0 => Some(format!("{key}={count}")),
                _ => None,
            })
            .chain(
                self.elapse
                    .iter()
                    .filter(|elapse| !elapse.is_empty())
                    .map(|elapse| format!("elapse={elapse}")),
            )
            .collect()
    }

    /// value of the `-L` option, the resource group always leads
    pub fn to_argument(&self, resource_group: &str) -> String {
        std::iter::once(format!("rscgrp={resource_group}"))
            .chain(self.clauses())
            .join(",")
    }
}

/// Extract the job id from the submission output.
///
/// The id is the second-to-last token of the first line, e.g.
/// `[INFO] PJM 0000 pjsub Job 99999 submitted.`. Error messages share the shape, so the token
/// also has to start with a digit.
pub fn parse_job_id(output: &str) -> Option<String> {
    let first_line = output.lines().next()?;
    let mut tokens = first_line.split_whitespace().rev();
    tokens.next()?;

    tokens
        .next()
        .filter(|token| token.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_owned)
}
