use std::mem;
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use anyhow::Result;

use crate::common::types::{Page, PageId, Value, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

// Header layout:
// - is_leaf: u8 (1 byte)
// - key_count: u16 (2 bytes)
// - next_leaf: u64 (8 bytes, 0 if None)
// - values_offset: u16 (2 bytes)
const HEADER_SIZE: usize = 13;

/// Serialize a B+Tree node into a page.
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    page.data.fill(0);

    page.data[0] = if node.is_leaf { 1 } else { 0 };
    LittleEndian::write_u16(&mut page.data[1..3], node.keys.len() as u16);
    LittleEndian::write_u64(&mut page.data[3..11], node.next_leaf.unwrap_or(0));

    let mut offset = HEADER_SIZE;

    for key in &node.keys {
        let key_bytes = bincode::serialize(key)
            .map_err(|e| BTreeError::SerializationError(e.to_string()))?;

        if offset + key_bytes.len() + 2 > PAGE_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }

        LittleEndian::write_u16(&mut page.data[offset..offset + 2], key_bytes.len() as u16);
        offset += 2;
        page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
        offset += key_bytes.len();
    }

    // Record where the value/child section starts.
    LittleEndian::write_u16(&mut page.data[11..13], offset as u16);

    if node.is_leaf {
        for value in &node.values {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }
            LittleEndian::write_u64(&mut page.data[offset..offset + 8], *value);
            offset += 8;
        }
    } else {
        for child in &node.children {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }
            LittleEndian::write_u64(&mut page.data[offset..offset + 8], *child);
            offset += 8;
        }
    }

    Ok(())
}

/// Deserialize a B+Tree node from a page.
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: DeserializeOwned + Clone + Ord,
{
    let is_leaf = page.data[0] == 1;
    let key_count = LittleEndian::read_u16(&page.data[1..3]) as usize;
    let next_leaf_val = LittleEndian::read_u64(&page.data[3..11]);
    let next_leaf = if next_leaf_val == 0 {
        None
    } else {
        Some(next_leaf_val)
    };
    let values_offset = LittleEndian::read_u16(&page.data[11..13]) as usize;

    let mut offset = HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);

    for _ in 0..key_count {
        if offset + 2 > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key_len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
        offset += 2;

        if offset + key_len > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key = bincode::deserialize(&page.data[offset..offset + key_len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
        keys.push(key);
        offset += key_len;
    }

    let mut values = Vec::new();
    let mut children = Vec::new();
    offset = values_offset;

    if is_leaf {
        for _ in 0..key_count {
            values.push(LittleEndian::read_u64(&page.data[offset..offset + 8]) as Value);
            offset += 8;
        }
    } else {
        // Internal nodes have key_count + 1 children.
        let child_count = if key_count == 0 && values_offset == 0 {
            0
        } else {
            key_count + 1
        };
        for _ in 0..child_count {
            children.push(LittleEndian::read_u64(&page.data[offset..offset + 8]) as PageId);
            offset += 8;
        }
    }

    Ok(BTreeNode {
        is_leaf,
        keys,
        children,
        values,
        next_leaf,
    })
}

/// Calculate the B+Tree order (max children per node) for a key type.
///
/// Conservative estimate from the fixed page capacity; variable-size
/// keys that overflow it surface as `NodeTooLarge` at serialization time.
pub fn calculate_btree_order<K>() -> usize {
    let key_size = mem::size_of::<K>() + 2; // 2-byte length prefix
    let value_size = mem::size_of::<Value>();

    let order = (PAGE_SIZE - HEADER_SIZE) / (key_size + value_size);

    order.max(4)
}
