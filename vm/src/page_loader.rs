//! Executable images as seen by the fault path: a list of loadable sections,
//! each able to fill a frame with one of its pages.

/// One loadable section of an executable image.
pub trait PageLoader: Send + Sync {
    fn first_vpn(&self) -> usize;

    fn page_count(&self) -> usize;

    fn is_read_only(&self) -> bool;

    /// Fills `target` (exactly one page) with page `index` of this section.
    fn load_page_into(&self, index: usize, target: &mut [u8]);

    fn contains(&self, vpn: usize) -> bool {
        vpn >= self.first_vpn() && vpn < self.first_vpn() + self.page_count()
    }
}

/// Section backed by bytes held in memory. Pages past the end of `data` read as zero.
#[derive(Clone, Debug)]
pub struct ImageSection {
    name: String,
    first_vpn: usize,
    page_count: usize,
    read_only: bool,
    page_size: usize,
    data: Vec<u8>,
}

impl ImageSection {
    pub fn new(
        name: impl Into<String>,
        first_vpn: usize,
        page_count: usize,
        read_only: bool,
        page_size: usize,
        data: Vec<u8>,
    ) -> Self {
        ImageSection {
            name: name.into(),
            first_vpn,
            page_count,
            read_only,
            page_size,
            data,
        }
    }

    /// Section sized to hold all of `data`.
    pub fn from_bytes(
        name: impl Into<String>,
        first_vpn: usize,
        read_only: bool,
        page_size: usize,
        data: Vec<u8>,
    ) -> Self {
        let page_count = data.len().div_ceil(page_size).max(1);
        ImageSection::new(name, first_vpn, page_count, read_only, page_size, data)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PageLoader for ImageSection {
    fn first_vpn(&self) -> usize {
        self.first_vpn
    }

    fn page_count(&self) -> usize {
        self.page_count
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn load_page_into(&self, index: usize, target: &mut [u8]) {
        assert!(index < self.page_count, "section {}: page {} out of range", self.name, index);
        debug_assert_eq!(target.len(), self.page_size);

        let start = (index * self.page_size).min(self.data.len());
        let end = (start + target.len()).min(self.data.len());
        let n = end - start;

        target[..n].copy_from_slice(&self.data[start..end]);
        target[n..].fill(0);
    }
}

/// An executable image: its sections in load order.
#[derive(Default)]
pub struct ExecutableImage {
    sections: Vec<Box<dyn PageLoader>>,
}

impl ExecutableImage {
    pub fn new() -> Self {
        ExecutableImage::default()
    }

    pub fn with_section(mut self, section: impl PageLoader + 'static) -> Self {
        self.sections.push(Box::new(section));
        self
    }

    pub fn push(&mut self, section: Box<dyn PageLoader>) {
        self.sections.push(section);
    }

    pub fn sections(&self) -> &[Box<dyn PageLoader>] {
        &self.sections
    }

    /// The section holding `vpn`, with the page's index inside it.
    pub fn section_for(&self, vpn: usize) -> Option<(&dyn PageLoader, usize)> {
        self.sections
            .iter()
            .find(|s| s.contains(vpn))
            .map(|s| (s.as_ref(), vpn - s.first_vpn()))
    }
}
