//! Update value lists as seen by the broker.
//!
//! A PUBLISH body is `(UpdateHeaderList, value list 1, ..., value list N)`.
//! The broker never knows the element types of the value lists: it only
//! needs to count the updates and copy the entries selected for a
//! subscriber into that subscriber's NOTIFY. [`UpdateValueHandler`]
//! abstracts those steps so that services with one or several value lists
//! share the same fan-out code.

use mal_core::{AbstractElement, Body, BodyError};
use rmpv::Value;

/// Per-publish staging of the value lists for one fan-out.
pub trait UpdateValueHandler: Send {
    /// Reads the value lists from a PUBLISH body positioned after the headers.
    ///
    /// # Errors
    ///
    /// Returns a `BodyError` when a value list is missing or malformed.
    fn decode_update_value_list(&mut self, body: &mut Body) -> Result<(), BodyError>;

    /// Installs value lists handed over in-process.
    ///
    /// # Errors
    ///
    /// Returns a `BodyError` when the number or shape of the lists is wrong.
    fn init_update_value_list(&mut self, values: Vec<AbstractElement>) -> Result<(), BodyError>;

    /// Number of updates carried.
    fn update_count(&self) -> usize;

    /// Stages the entries at `index` for the current subscriber.
    fn append_value(&mut self, index: usize);

    /// Writes the staged entries as the NOTIFY value lists.
    fn encode_notify_values(&self, body: &mut Body);

    /// Clears the staged entries.
    fn reset_values(&mut self);
}

/// One list plus the entries staged from it.
#[derive(Debug, Clone, Default)]
struct StagedList {
    short_form: i64,
    items: Vec<Value>,
    staged: Vec<Value>,
}

impl StagedList {
    fn from_element(index: usize, element: Option<AbstractElement>) -> Result<Self, BodyError> {
        let Some(element) = element else {
            return Ok(Self::default());
        };
        match element.value {
            Value::Array(items) => Ok(Self {
                short_form: element.short_form,
                items,
                staged: Vec::new(),
            }),
            Value::Nil => Ok(Self {
                short_form: element.short_form,
                ..Self::default()
            }),
            _ => Err(BodyError::UnexpectedType {
                index,
                expected: "update value list",
                reason: "abstract element is not a list".to_string(),
            }),
        }
    }

    fn append(&mut self, index: usize) {
        if let Some(item) = self.items.get(index) {
            self.staged.push(item.clone());
        }
    }

    fn encode_staged(&self, body: &mut Body) {
        body.encode_abstract(Some(&AbstractElement {
            short_form: self.short_form,
            value: Value::Array(self.staged.clone()),
        }));
    }
}

/// Handler for services publishing a single value list.
#[derive(Debug, Clone, Default)]
pub struct ValueListHandler {
    list: StagedList,
}

impl UpdateValueHandler for ValueListHandler {
    fn decode_update_value_list(&mut self, body: &mut Body) -> Result<(), BodyError> {
        let index = body.len() - body.remaining();
        self.list = StagedList::from_element(index, body.decode_abstract()?)?;
        Ok(())
    }

    fn init_update_value_list(&mut self, values: Vec<AbstractElement>) -> Result<(), BodyError> {
        if values.len() != 1 {
            return Err(BodyError::Decode(format!(
                "expected 1 update value list, got {}",
                values.len()
            )));
        }
        self.list = StagedList::from_element(0, values.into_iter().next())?;
        Ok(())
    }

    fn update_count(&self) -> usize {
        self.list.items.len()
    }

    fn append_value(&mut self, index: usize) {
        self.list.append(index);
    }

    fn encode_notify_values(&self, body: &mut Body) {
        self.list.encode_staged(body);
    }

    fn reset_values(&mut self) {
        self.list.staged.clear();
    }
}

/// Handler for services publishing several parallel value lists. Every list
/// must hold one entry per update header.
#[derive(Debug, Clone)]
pub struct MultiValueListHandler {
    expected_lists: usize,
    lists: Vec<StagedList>,
}

impl MultiValueListHandler {
    #[must_use]
    pub fn new(expected_lists: usize) -> Self {
        Self {
            expected_lists,
            lists: Vec::new(),
        }
    }

    fn check_lengths(&self) -> Result<(), BodyError> {
        let mut lengths = self.lists.iter().map(|list| list.items.len());
        if let Some(first) = lengths.next() {
            if let Some(other) = lengths.find(|len| *len != first) {
                return Err(BodyError::Decode(format!(
                    "update value lists differ in length: {first} and {other}"
                )));
            }
        }
        Ok(())
    }
}

impl UpdateValueHandler for MultiValueListHandler {
    fn decode_update_value_list(&mut self, body: &mut Body) -> Result<(), BodyError> {
        let start = body.len() - body.remaining();
        self.lists = (0..self.expected_lists)
            .map(|offset| StagedList::from_element(start + offset, body.decode_abstract()?))
            .collect::<Result<_, _>>()?;
        self.check_lengths()
    }

    fn init_update_value_list(&mut self, values: Vec<AbstractElement>) -> Result<(), BodyError> {
        if values.len() != self.expected_lists {
            return Err(BodyError::Decode(format!(
                "expected {} update value lists, got {}",
                self.expected_lists,
                values.len()
            )));
        }
        self.lists = values
            .into_iter()
            .enumerate()
            .map(|(index, element)| StagedList::from_element(index, Some(element)))
            .collect::<Result<_, _>>()?;
        self.check_lengths()
    }

    fn update_count(&self) -> usize {
        self.lists.first().map_or(0, |list| list.items.len())
    }

    fn append_value(&mut self, index: usize) {
        for list in &mut self.lists {
            list.append(index);
        }
    }

    fn encode_notify_values(&self, body: &mut Body) {
        for list in &self.lists {
            list.encode_staged(body);
        }
    }

    fn reset_values(&mut self) {
        for list in &mut self.lists {
            list.staged.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use mal_core::Blob;

    use super::*;

    fn blobs(values: &[&[u8]]) -> AbstractElement {
        let list: Vec<Blob> = values.iter().map(|v| Blob::from(*v)).collect();
        AbstractElement::from_element(&list).unwrap()
    }

    #[test]
    fn stages_selected_entries_only() {
        let mut handler = ValueListHandler::default();
        handler
            .init_update_value_list(vec![blobs(&[b"a", b"b", b"c"])])
            .unwrap();
        assert_eq!(handler.update_count(), 3);

        handler.append_value(0);
        handler.append_value(2);
        let mut body = Body::new();
        handler.encode_notify_values(&mut body);
        let staged: Vec<Blob> = body.decode_last_parameter(true).unwrap().unwrap();
        assert_eq!(staged, vec![Blob::from(&b"a"[..]), Blob::from(&b"c"[..])]);

        handler.reset_values();
        let mut empty = Body::new();
        handler.encode_notify_values(&mut empty);
        let staged: Vec<Blob> = empty.decode_last_parameter(true).unwrap().unwrap();
        assert!(staged.is_empty());
    }

    #[test]
    fn decodes_from_publish_body() {
        let mut body = Body::new();
        body.encode_parameter(&Vec::<u32>::new()).unwrap();
        body.encode_abstract(Some(&blobs(&[b"x"])));
        body.reset(false);
        body.decode_parameter::<Vec<u32>>().unwrap();

        let mut handler = ValueListHandler::default();
        handler.decode_update_value_list(&mut body).unwrap();
        assert_eq!(handler.update_count(), 1);
    }

    #[test]
    fn multi_list_handler_keeps_lists_parallel() {
        let mut handler = MultiValueListHandler::new(2);
        let names = AbstractElement::from_element(&vec!["n0".to_string(), "n1".to_string()]).unwrap();
        handler
            .init_update_value_list(vec![blobs(&[b"0", b"1"]), names])
            .unwrap();
        assert_eq!(handler.update_count(), 2);

        handler.append_value(1);
        let mut body = Body::new();
        handler.encode_notify_values(&mut body);
        let first: Vec<Blob> = body.decode_last_parameter(true).unwrap().unwrap();
        let second: Vec<String> = body.decode_last_parameter(true).unwrap().unwrap();
        assert_eq!(first, vec![Blob::from(&b"1"[..])]);
        assert_eq!(second, vec!["n1".to_string()]);
    }

    #[test]
    fn multi_list_handler_rejects_uneven_lists() {
        let mut handler = MultiValueListHandler::new(2);
        let result = handler.init_update_value_list(vec![blobs(&[b"0", b"1"]), blobs(&[b"0"])]);
        assert!(result.is_err());
    }

    #[test]
    fn wrong_list_count_is_rejected() {
        let mut handler = ValueListHandler::default();
        assert!(handler.init_update_value_list(Vec::new()).is_err());
    }
}
