//! `opendir`/`readdir`/`rewinddir` over a flat key space, one level at a time
//! via delimiter listings.

use crate::cadapter::client::{ListPage, ListRequest, ObjectBackend, ObjectClient};
use crate::error::Result;
use crate::path::VirtualPath;
use std::collections::VecDeque;
use std::sync::Arc;

pub const DELIMITER: &str = "/";
pub const DEFAULT_PAGE_SIZE: usize = 1000;

pub struct DirIterator<B: ObjectBackend> {
    client: Arc<ObjectClient<B>>,
    prefix: String,
    page_size: usize,
    page_token: Option<String>,
    batch: VecDeque<String>,
    exhausted: bool,
}

impl<B: ObjectBackend> DirIterator<B> {
    /// `Ok(None)` if nothing lives under `path`. The root always exists.
    pub async fn open(
        client: Arc<ObjectClient<B>>,
        path: &VirtualPath,
        page_size: usize,
    ) -> Result<Option<Self>> {
        let prefix = if path.is_root() {
            String::new()
        } else {
            format!("{}{DELIMITER}", path.target)
        };
        let mut iter = Self {
            client,
            prefix,
            page_size: page_size.max(1),
            page_token: None,
            batch: VecDeque::new(),
            exhausted: false,
        };
        let found = iter.load_first_page().await?;
        if !found && !path.is_root() {
            return Ok(None);
        }
        Ok(Some(iter))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn request(&self) -> ListRequest {
        ListRequest::new(self.prefix.clone())
            .delimiter(DELIMITER)
            .max_keys(self.page_size)
            .page_token(self.page_token.clone())
    }

    /// Returns whether the first page had any entries at all.
    async fn load_first_page(&mut self) -> Result<bool> {
        self.page_token = None;
        self.batch.clear();
        self.exhausted = false;
        let page = self.client.list_objects(&self.request()).await?;
        let found = !page.is_empty();
        self.absorb(page);
        Ok(found)
    }

    fn absorb(&mut self, page: ListPage) {
        let mut names: Vec<String> = page
            .objects
            .iter()
            .filter_map(|o| o.key.strip_prefix(&self.prefix))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .chain(page.common_prefixes.iter().filter_map(|p| {
                p.strip_prefix(&self.prefix)
                    .map(|name| name.trim_end_matches(DELIMITER).to_string())
            }))
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names.dedup();
        self.batch.extend(names);
        self.exhausted = page.next_token.is_none();
        self.page_token = page.next_token;
    }

    /// Next leaf name, or `None` at the end of the listing.
    pub async fn next(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(name) = self.batch.pop_front() {
                return Ok(Some(name));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self.client.list_objects(&self.request()).await?;
            self.absorb(page);
        }
    }

    /// Restart the listing from the beginning.
    pub async fn rewind(&mut self) -> Result<()> {
        self.load_first_page().await?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.batch.clear();
        self.page_token = None;
        self.exhausted = true;
    }
}
