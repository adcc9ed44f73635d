use exam_core::SectionPlan;
use exam_core::model::{ExamFamily, QuestionId, QuestionRange, Session};
use storage::QuestionRecord;

/// Decides which timed section a question belongs to.
///
/// `None` keeps the question answerable but outside every timed section.
pub trait SectionClassifier: Send + Sync {
    fn classify(&self, question: &QuestionRecord, family: ExamFamily) -> Option<String>;
}

impl<F> SectionClassifier for F
where
    F: Fn(&QuestionRecord, ExamFamily) -> Option<String> + Send + Sync,
{
    fn classify(&self, question: &QuestionRecord, family: ExamFamily) -> Option<String> {
        self(question, family)
    }
}

/// Groups questions by the part they were published under.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartNameClassifier;

impl SectionClassifier for PartNameClassifier {
    fn classify(&self, question: &QuestionRecord, _family: ExamFamily) -> Option<String> {
        let name = question.part_name.trim();
        (!name.is_empty()).then(|| name.to_owned())
    }
}

/// Question layout for one session: ids and answer key by range position, plus sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionPlan {
    pub question_order: Vec<Option<QuestionId>>,
    pub answer_key: Vec<Option<String>>,
    pub sections: Vec<SectionPlan>,
}

impl QuestionPlan {
    #[must_use]
    pub fn has_sections(&self) -> bool {
        !self.sections.is_empty()
    }
}

/// Lays a paper's questions out over a session's range, part filter and section choice.
pub struct PlanBuilder<'a> {
    range: QuestionRange,
    family: ExamFamily,
    selected_sections: &'a [String],
    selected_part_ids: &'a [String],
    classifier: &'a dyn SectionClassifier,
}

impl<'a> PlanBuilder<'a> {
    #[must_use]
    pub fn new(session: &'a Session, classifier: &'a dyn SectionClassifier) -> Self {
        Self {
            range: session.question_range(),
            family: session.exam_family(),
            selected_sections: session.selected_sections(),
            selected_part_ids: session.selected_part_ids(),
            classifier,
        }
    }

    /// Build the plan. Sections follow the selected order, or first appearance when
    /// nothing was selected; each gets the family's limit for its question count.
    pub fn build(self, questions: impl IntoIterator<Item = QuestionRecord>) -> QuestionPlan {
        let total = self.range.total();
        let mut question_order = vec![None; total];
        let mut answer_key = vec![None; total];
        let mut groups: Vec<(String, Vec<QuestionId>)> = Vec::new();

        let mut questions: Vec<QuestionRecord> = questions.into_iter().collect();
        questions.sort_by_key(|q| q.number);

        for question in questions {
            let Some(index) = self.range.index_of(question.number) else {
                continue;
            };
            if !self.selected_part_ids.is_empty() && !self.selected_part_ids.contains(&question.part_id) {
                continue;
            }
            question_order[index] = Some(question.id.clone());
            answer_key[index] = question
                .correct_choice
                .as_deref()
                .map(str::trim)
                .filter(|choice| !choice.is_empty())
                .map(str::to_owned);

            let Some(label) = self.classifier.classify(&question, self.family) else {
                continue;
            };
            if !self.selected_sections.is_empty() && !self.selected_sections.contains(&label) {
                continue;
            }
            match groups.iter_mut().find(|(existing, _)| *existing == label) {
                Some((_, ids)) => ids.push(question.id),
                None => groups.push((label, vec![question.id])),
            }
        }

        if !self.selected_sections.is_empty() {
            groups.sort_by_key(|(label, _)| {
                self.selected_sections
                    .iter()
                    .position(|selected| selected == label)
                    .unwrap_or(usize::MAX)
            });
        }

        let sections = groups
            .into_iter()
            .map(|(label, ids)| {
                let minutes = self.family.section_time_limit_minutes(ids.len());
                SectionPlan::new(label, ids, minutes)
            })
            .collect();

        QuestionPlan {
            question_order,
            answer_key,
            sections,
        }
    }
}
