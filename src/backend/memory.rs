//! 内存工作簿后端
//!
//! 供无界面驱动程序与测试使用：稀疏单元格、命名区域、ARGB 颜色校验；
//! MemoryProbe 可注入读 / 写故障和延迟，并统计后端调用次数。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::{
    Backend, CellRecord, CellRef, CellStyle, CellValue, Connector, DocumentId, OpenTarget,
    RangeRef, SheetRange,
};
use crate::core::BackendError;

/// 后端对非法颜色的报错文本（与 openpyxl 保持一致，自动修复逻辑按它识别）
pub const INVALID_COLOR_MESSAGE: &str = "Colors must be aRGB hex values";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_argb(s: &str) -> bool {
    s.len() == 8 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Clone, Debug, Default, PartialEq)]
struct CellData {
    value: CellValue,
    formula: Option<String>,
    style: CellStyle,
}

impl CellData {
    fn is_blank(&self) -> bool {
        self.value.is_empty() && self.formula.is_none() && self.style.is_default()
    }
}

#[derive(Clone, Debug)]
struct MemorySheet {
    name: String,
    cells: BTreeMap<CellRef, CellData>,
}

impl MemorySheet {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cells: BTreeMap::new(),
        }
    }

    fn used_range(&self) -> Option<RangeRef> {
        self.cells
            .iter()
            .filter(|(_, d)| !d.value.is_empty() || d.formula.is_some())
            .map(|(c, _)| RangeRef::single(*c))
            .reduce(|acc, r| acc.union(&r))
    }
}

/// 内存中的工作簿
#[derive(Clone, Debug)]
pub struct MemoryWorkbook {
    id: DocumentId,
    sheets: Vec<MemorySheet>,
    names: BTreeMap<String, String>,
}

impl MemoryWorkbook {
    /// 新工作簿，自带一张 Sheet1
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            sheets: vec![MemorySheet::new("Sheet1")],
            names: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// 测试 / 演示用的种子数据写入；不经过探针
    pub fn with_sheet(mut self, name: &str) -> Self {
        if self.sheet_index(name).is_none() {
            self.sheets.push(MemorySheet::new(name));
        }
        self
    }

    pub fn with_value(mut self, sheet: &str, addr: &str, value: CellValue) -> Self {
        let cell = match CellRef::parse(addr) {
            Ok(c) => c,
            Err(_) => return self,
        };
        let idx = match self.sheet_index(sheet) {
            Some(i) => i,
            None => {
                self.sheets.push(MemorySheet::new(sheet));
                self.sheets.len() - 1
            }
        };
        self.sheets[idx].cells.entry(cell).or_default().value = value;
        self
    }

    pub fn with_name(mut self, name: &str, refers_to: &str) -> Self {
        self.names.insert(name.to_string(), refers_to.to_string());
        self
    }

    /// 直接读取值（测试断言用）
    pub fn value(&self, sheet: &str, addr: &str) -> Option<CellValue> {
        let cell = CellRef::parse(addr).ok()?;
        let idx = self.sheet_index(sheet)?;
        Some(
            self.sheets[idx]
                .cells
                .get(&cell)
                .map(|d| d.value.clone())
                .unwrap_or_default(),
        )
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn sheet_index(&self, name: &str) -> Option<usize> {
        self.sheets
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn sheet_mut(&mut self, name: &str) -> Result<&mut MemorySheet, BackendError> {
        let idx = self
            .sheet_index(name)
            .ok_or_else(|| BackendError::NotFound(format!("Sheet '{name}' not found")))?;
        Ok(&mut self.sheets[idx])
    }
}

/// 故障注入与调用统计；由连接器创建的所有包装对象共享
#[derive(Debug, Default)]
pub struct MemoryProbe {
    calls: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    read_faults: Mutex<VecDeque<Option<BackendError>>>,
    write_faults: Mutex<VecDeque<Option<BackendError>>>,
    latency: Mutex<Duration>,
}

impl MemoryProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 后端调用总次数（读 + 写 + 关闭）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 接下来的写调用依次消费脚本：None 正常执行，Some(e) 返回错误
    pub fn script_writes(&self, script: impl IntoIterator<Item = Option<BackendError>>) {
        lock(&self.write_faults).extend(script);
    }

    pub fn script_reads(&self, script: impl IntoIterator<Item = Option<BackendError>>) {
        lock(&self.read_faults).extend(script);
    }

    /// 每次调用前的人为延迟（模拟慢后端 / 超时）
    pub fn set_latency(&self, d: Duration) {
        *lock(&self.latency) = d;
    }

    fn enter(&self, write: bool) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let fault = if write {
            self.writes.fetch_add(1, Ordering::SeqCst);
            lock(&self.write_faults).pop_front()
        } else {
            self.reads.fetch_add(1, Ordering::SeqCst);
            lock(&self.read_faults).pop_front()
        };
        match fault.flatten() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 指向某个内存工作簿的连接包装；每次 attach 都会得到一个新的包装对象
pub struct MemoryBackend {
    book: Arc<Mutex<MemoryWorkbook>>,
    probe: Arc<MemoryProbe>,
    closed: bool,
}

impl MemoryBackend {
    pub fn new(book: Arc<Mutex<MemoryWorkbook>>, probe: Arc<MemoryProbe>) -> Self {
        Self {
            book,
            probe,
            closed: false,
        }
    }

    fn read(&self) -> Result<MutexGuard<'_, MemoryWorkbook>, BackendError> {
        self.check_open()?;
        self.probe.enter(false)?;
        Ok(lock(&self.book))
    }

    fn write(&self) -> Result<MutexGuard<'_, MemoryWorkbook>, BackendError> {
        self.check_open()?;
        self.probe.enter(true)?;
        Ok(lock(&self.book))
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed {
            Err(BackendError::Disconnected("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Backend for MemoryBackend {
    fn document_id(&self) -> DocumentId {
        lock(&self.book).id.clone()
    }

    fn sheet_names(&mut self) -> Result<Vec<String>, BackendError> {
        Ok(self.read()?.sheet_names())
    }

    fn used_range(&mut self, sheet: &str) -> Result<Option<RangeRef>, BackendError> {
        let mut book = self.read()?;
        Ok(book.sheet_mut(sheet)?.used_range())
    }

    fn read_cells(&mut self, sheet: &str, range: &RangeRef) -> Result<Vec<CellRecord>, BackendError> {
        let mut book = self.read()?;
        let s = book.sheet_mut(sheet)?;
        Ok(range
            .cells()
            .map(|cell| match s.cells.get(&cell) {
                Some(d) => CellRecord {
                    cell,
                    value: d.value.clone(),
                    formula: d.formula.clone(),
                    style: d.style.clone(),
                },
                None => CellRecord::blank(cell),
            })
            .collect())
    }

    fn write_cells(&mut self, sheet: &str, cells: &[CellRecord]) -> Result<(), BackendError> {
        let mut book = self.write()?;
        let s = book.sheet_mut(sheet)?;
        for rec in cells {
            if rec.is_blank() {
                s.cells.remove(&rec.cell);
            } else {
                s.cells.insert(
                    rec.cell,
                    CellData {
                        value: rec.value.clone(),
                        formula: rec.formula.clone(),
                        style: rec.style.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    fn set_value(&mut self, sheet: &str, cell: CellRef, value: &CellValue) -> Result<(), BackendError> {
        let mut book = self.write()?;
        let s = book.sheet_mut(sheet)?;
        let data = s.cells.entry(cell).or_default();
        data.value = value.clone();
        data.formula = None;
        if data.is_blank() {
            s.cells.remove(&cell);
        }
        Ok(())
    }

    fn set_formula(&mut self, sheet: &str, cell: CellRef, formula: &str) -> Result<(), BackendError> {
        if !formula.starts_with('=') {
            return Err(BackendError::Invalid(format!("Formula must start with '=': {formula}")));
        }
        let mut book = self.write()?;
        let s = book.sheet_mut(sheet)?;
        let data = s.cells.entry(cell).or_default();
        data.formula = Some(formula.to_string());
        // 内存后端不求值，用公式文本占位
        data.value = CellValue::Text(formula.to_string());
        Ok(())
    }

    fn apply_style(&mut self, sheet: &str, range: &RangeRef, style: &CellStyle) -> Result<(), BackendError> {
        if style.colors().iter().any(|c| !is_argb(c)) {
            return Err(BackendError::Invalid(INVALID_COLOR_MESSAGE.to_string()));
        }
        let mut book = self.write()?;
        let s = book.sheet_mut(sheet)?;
        for cell in range.cells() {
            s.cells.entry(cell).or_default().style.merge(style);
        }
        Ok(())
    }

    fn create_sheet(&mut self, name: &str, index: Option<usize>) -> Result<(), BackendError> {
        let mut book = self.write()?;
        if book.sheet_index(name).is_some() {
            return Err(BackendError::Invalid(format!("Sheet '{name}' already exists")));
        }
        let at = index.unwrap_or(book.sheets.len()).min(book.sheets.len());
        book.sheets.insert(at, MemorySheet::new(name));
        Ok(())
    }

    fn delete_sheet(&mut self, name: &str) -> Result<(), BackendError> {
        let mut book = self.write()?;
        let idx = book
            .sheet_index(name)
            .ok_or_else(|| BackendError::NotFound(format!("Sheet '{name}' not found")))?;
        if book.sheets.len() == 1 {
            return Err(BackendError::Invalid(
                "A workbook must contain at least one visible worksheet".to_string(),
            ));
        }
        book.sheets.remove(idx);
        Ok(())
    }

    fn named_ranges(&mut self) -> Result<BTreeMap<String, String>, BackendError> {
        Ok(self.read()?.names.clone())
    }

    fn set_named_range(&mut self, name: &str, refers_to: &str) -> Result<(), BackendError> {
        let target = SheetRange::parse(refers_to.trim_start_matches('=').replace('$', "").as_str())
            .map_err(BackendError::Invalid)?;
        let mut book = self.write()?;
        if book.sheet_index(&target.sheet).is_none() {
            return Err(BackendError::NotFound(format!("Sheet '{}' not found", target.sheet)));
        }
        book.names.insert(name.to_string(), target.to_string());
        Ok(())
    }

    fn remove_named_range(&mut self, name: &str) -> Result<(), BackendError> {
        let mut book = self.write()?;
        book.names.remove(name);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.closed = true;
        Ok(())
    }
}

/// 内存连接器：按名称登记「已打开」的工作簿，新建实例或附着时都按名称查找
#[derive(Clone, Default)]
pub struct MemoryConnector {
    books: Arc<Mutex<HashMap<String, Arc<Mutex<MemoryWorkbook>>>>>,
    probe: Arc<MemoryProbe>,
    create_faults: Arc<Mutex<VecDeque<BackendError>>>,
    attach_faults: Arc<Mutex<VecDeque<BackendError>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> Arc<MemoryProbe> {
        Arc::clone(&self.probe)
    }

    /// 登记一个已打开的工作簿（模拟用户已在运行的实例）
    pub fn register(&self, book: MemoryWorkbook) -> Arc<Mutex<MemoryWorkbook>> {
        let key = book.id.key();
        let handle = Arc::new(Mutex::new(book));
        lock(&self.books).insert(key, Arc::clone(&handle));
        handle
    }

    pub fn book(&self, name: &str) -> Option<Arc<Mutex<MemoryWorkbook>>> {
        lock(&self.books).get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn fail_create(&self, err: BackendError) {
        lock(&self.create_faults).push_back(err);
    }

    pub fn fail_attach(&self, err: BackendError) {
        lock(&self.attach_faults).push_back(err);
    }
}

impl Connector for MemoryConnector {
    fn create(&self, target: &OpenTarget) -> Result<Box<dyn Backend>, BackendError> {
        if let Some(e) = lock(&self.create_faults).pop_front() {
            return Err(e);
        }
        // 专用实例打开同名文档时看到的是同一份内容
        let handle = match self.book(&target.document.name) {
            Some(h) => h,
            None => self.register(MemoryWorkbook::new(target.document.clone())),
        };
        Ok(Box::new(MemoryBackend::new(handle, self.probe())))
    }

    fn attach(&self, target: &OpenTarget) -> Result<Box<dyn Backend>, BackendError> {
        if let Some(e) = lock(&self.attach_faults).pop_front() {
            return Err(e);
        }
        let handle = self.book(&target.document.name).ok_or_else(|| {
            BackendError::NotFound(format!("No running instance has '{}' open", target.document))
        })?;
        Ok(Box::new(MemoryBackend::new(handle, self.probe())))
    }
}
