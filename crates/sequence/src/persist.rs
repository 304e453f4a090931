use snafu::{OptionExt, ResultExt};
use storyreel_storage::{
    ElementHistory, ElementKind, NewSegment, SegmentRecord, SequenceId, Storage, UserId,
};

use crate::error::{OutOfRangeSnafu, SequenceResult, StorageSnafu, UnknownSequenceSnafu};
use crate::segment::Segment;
use crate::sequence::Sequence;
use crate::versions::VersionedElement;

/// Writes `sequence` under `owner` with every version, active pointer and label, and
/// caches its compiled script. Nothing is stored when any part fails.
pub async fn save_sequence<S>(
    storage: &S,
    owner_id: UserId,
    sequence: &Sequence,
) -> SequenceResult<SequenceId>
where
    S: Storage + ?Sized,
{
    let segments = batch_segments(sequence)?;
    let record = storage
        .store_sequence(
            owner_id,
            sequence.name(),
            Some(sequence.compiled_script()),
            segments,
        )
        .await
        .context(StorageSnafu {
            stage: "save-sequence",
        })?;

    tracing::info!(
        sequence_id = %record.id,
        name = %sequence.name(),
        segments = sequence.len(),
        "sequence saved"
    );
    Ok(record.id)
}

/// Writes the current order and content of `sequence` over the stored sequence
/// `sequence_id`, keeping its owner and name. Either everything is replaced or nothing is.
pub async fn update_sequence<S>(
    storage: &S,
    sequence_id: SequenceId,
    sequence: &Sequence,
) -> SequenceResult<()>
where
    S: Storage + ?Sized,
{
    let segments = batch_segments(sequence)?;
    storage
        .replace_segments(sequence_id, Some(sequence.compiled_script()), segments)
        .await
        .context(StorageSnafu {
            stage: "update-sequence",
        })?;

    tracing::info!(sequence_id = %sequence_id, segments = sequence.len(), "sequence updated");
    Ok(())
}

fn batch_segments(sequence: &Sequence) -> SequenceResult<Vec<NewSegment>> {
    sequence
        .segments()
        .iter()
        .map(|segment| {
            Ok(NewSegment {
                label: segment.label().to_string(),
                text: element_history(segment, ElementKind::Text)?,
                image: element_history(segment, ElementKind::Image)?,
                audio: element_history(segment, ElementKind::Audio)?,
            })
        })
        .collect()
}

fn element_history(segment: &Segment, kind: ElementKind) -> SequenceResult<ElementHistory> {
    let element = segment.element(kind);
    let active = element
        .active_index()
        .map(|index| {
            u32::try_from(index).ok().context(OutOfRangeSnafu {
                stage: "save-sequence-active-version",
                index,
                len: element.len(),
            })
        })
        .transpose()?;

    Ok(ElementHistory {
        versions: element.versions().to_vec(),
        active,
    })
}

/// Rebuilds a stored sequence with its ordering and active pointers.
pub async fn load_sequence<S>(storage: &S, sequence_id: SequenceId) -> SequenceResult<Sequence>
where
    S: Storage + ?Sized,
{
    let record = storage
        .get_sequence(sequence_id)
        .await
        .context(StorageSnafu {
            stage: "load-sequence-get",
        })?
        .context(UnknownSequenceSnafu {
            stage: "load-sequence-get",
            id: sequence_id.to_string(),
        })?;

    let stored_segments = storage
        .get_segments(sequence_id)
        .await
        .context(StorageSnafu {
            stage: "load-sequence-segments",
        })?;

    let mut segments = Vec::with_capacity(stored_segments.len());
    for stored in &stored_segments {
        let text = load_element(storage, stored, ElementKind::Text).await?;
        let image = load_element(storage, stored, ElementKind::Image).await?;
        let audio = load_element(storage, stored, ElementKind::Audio).await?;
        segments.push(Segment::from_parts(
            stored.label.clone().unwrap_or_default(),
            stored.position as usize,
            text,
            image,
            audio,
        ));
    }

    tracing::debug!(sequence_id = %sequence_id, segments = segments.len(), "sequence loaded");
    Ok(Sequence::from_segments(record.name, segments))
}

async fn load_element<S>(
    storage: &S,
    stored: &SegmentRecord,
    kind: ElementKind,
) -> SequenceResult<VersionedElement>
where
    S: Storage + ?Sized,
{
    let versions = storage
        .element_versions(stored.id, kind)
        .await
        .context(StorageSnafu {
            stage: "load-sequence-versions",
        })?;
    let active = stored
        .active_version(kind)
        .map(|version| version as usize);

    VersionedElement::from_parts(versions, active)
}
