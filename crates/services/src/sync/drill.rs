use storage::{DrillItemRecord, SessionRecord};

/// Drill items for every question flagged `add_to_drill` on an ended session.
///
/// Returns nothing while the session is still running.
#[must_use]
pub fn derive_drill_items(record: &SessionRecord) -> Vec<DrillItemRecord> {
    let Some(ended_at) = record.ended_at else {
        return Vec::new();
    };

    record
        .answers
        .iter()
        .enumerate()
        .filter(|(_, answer)| answer.add_to_drill)
        .map(|(index, answer)| {
            let correct_choice = Some(answer.correct_choice.trim())
                .filter(|choice| !choice.is_empty())
                .map(str::to_owned)
                .or_else(|| record.answer_key.get(index).cloned().flatten());
            DrillItemRecord {
                paper_id: record.paper_id.clone(),
                paper_name: record.paper_name.clone(),
                question_number: record.question_range.number_at(index),
                correct_choice,
                explanation: answer.explanation.clone(),
                origin_session_id: record.id,
                question_id: record.question_order.get(index).cloned().flatten(),
                last_wrong_at: ended_at,
                last_time_sec: record.per_question_sec.get(index).copied().unwrap_or(0),
            }
        })
        .collect()
}
