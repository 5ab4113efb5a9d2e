use std::path::Path;

/// Inputs the prompt templates draw from.
#[derive(Debug, Default, Clone)]
pub struct PromptContext {
    pub tasks_file: String,
    pub iteration: u32,
    pub feedback: Option<String>,
    pub learnings: Option<String>,
    /// Design-spec text for the final-plan validator (plan file or cached
    /// issue body).
    pub spec_text: Option<String>,
    /// Implementation and validator outputs for the cross-validator.
    pub impl_output: Option<String>,
    pub validation_output: Option<String>,
}

/// Prompt-text assembly seam. The orchestrator never concatenates prompt
/// strings itself.
pub trait PromptBuilder: Send + Sync {
    fn first_prompt(&self, ctx: &PromptContext) -> String;
    fn continue_prompt(&self, ctx: &PromptContext) -> String;
    fn validation_prompt(&self, ctx: &PromptContext) -> String;
    fn cross_validation_prompt(&self, ctx: &PromptContext) -> String;
    fn final_plan_prompt(&self, ctx: &PromptContext) -> String;
    fn tasks_validation_prompt(&self, ctx: &PromptContext) -> String;
}

/// Built-in templates. Each instructs the tool to end with the structured
/// marker block the watchdog and verdict extractor key on.
pub struct DefaultPrompts;

impl DefaultPrompts {
    fn push_learnings(prompt: &mut String, ctx: &PromptContext) {
        if let Some(learnings) = &ctx.learnings
            && !learnings.is_empty()
        {
            prompt.push_str("\n## Accumulated learnings from previous iterations\n\n");
            prompt.push_str(learnings);
            prompt.push('\n');
        }
    }
}

impl PromptBuilder for DefaultPrompts {
    fn first_prompt(&self, ctx: &PromptContext) -> String {
        let mut p = String::new();
        p.push_str(&format!(
            "Work through the unchecked tasks in {}. Pick the highest-leverage \
             unchecked item, implement it completely, and mark it checked.\n\n",
            ctx.tasks_file
        ));
        Self::push_learnings(&mut p, ctx);
        p.push_str(
            "\nIf you learned something future iterations need, add a `## Learnings` \
             section.\nEnd your reply with a line starting with RALPH_STATUS \
             summarising what you changed.\n",
        );
        p
    }

    fn continue_prompt(&self, ctx: &PromptContext) -> String {
        let mut p = String::new();
        p.push_str(&format!(
            "Continue working through the unchecked tasks in {} (iteration {}).\n\n",
            ctx.tasks_file, ctx.iteration
        ));
        if let Some(feedback) = &ctx.feedback
            && !feedback.is_empty()
        {
            p.push_str("## Validator feedback on the previous iteration\n\n");
            p.push_str(feedback);
            p.push_str("\n\n");
        }
        Self::push_learnings(&mut p, ctx);
        p.push_str(
            "\nAddress the feedback first, then continue with unchecked tasks. \
             If you learned something future iterations need, add a `## Learnings` \
             section.\nEnd your reply with a line starting with RALPH_STATUS.\n",
        );
        p
    }

    fn validation_prompt(&self, ctx: &PromptContext) -> String {
        format!(
            "Review the repository against the task list in {}.\n\
             Judge whether the checked-off tasks are genuinely done.\n\n\
             End your reply with a line of the form\n\
             RALPH_VALIDATION {{\"verdict\":\"COMPLETE|NEEDS_MORE_WORK|ESCALATE|INADMISSIBLE|BLOCKED\",\
             \"feedback\":\"...\",\"blocked_tasks\":[\"...\"]}}\n",
            ctx.tasks_file
        )
    }

    fn cross_validation_prompt(&self, ctx: &PromptContext) -> String {
        let mut p = String::from(
            "A validator approved the implementation below. Independently confirm \
             or reject that judgement.\n",
        );
        if let Some(impl_out) = &ctx.impl_output {
            p.push_str("\n## Implementation output\n\n");
            p.push_str(impl_out);
            p.push('\n');
        }
        if let Some(val_out) = &ctx.validation_output {
            p.push_str("\n## Validator output\n\n");
            p.push_str(val_out);
            p.push('\n');
        }
        p.push_str("\nReply with exactly one of: CONFIRMED or REJECTED, followed by your reasoning.\n");
        p
    }

    fn final_plan_prompt(&self, ctx: &PromptContext) -> String {
        let mut p = String::from("Compare the design spec against the completed task plan.\n");
        if let Some(spec) = &ctx.spec_text {
            p.push_str("\n## Design spec\n\n");
            p.push_str(spec);
            p.push('\n');
        }
        p.push_str(&format!("\n## Task plan\n\nSee {}.\n", ctx.tasks_file));
        p.push_str("\nReply APPROVE if the plan fully implements the spec, REJECT otherwise, with reasons.\n");
        p
    }

    fn tasks_validation_prompt(&self, ctx: &PromptContext) -> String {
        let mut p = String::from(
            "Judge whether the task list below is a faithful breakdown of the spec.\n",
        );
        if let Some(spec) = &ctx.spec_text {
            p.push_str("\n## Spec\n\n");
            p.push_str(spec);
            p.push('\n');
        }
        p.push_str(&format!("\n## Task list\n\nSee {}.\n", ctx.tasks_file));
        p.push_str("\nReply with exactly one of: VALID or INVALID, followed by your reasoning.\n");
        p
    }
}

/// Read a file into the context, logging instead of failing: prompt inputs
/// are best-effort.
pub fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => Some(s),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(path = %path.display(), "prompt input unreadable: {e}");
            None
        }
    }
}
