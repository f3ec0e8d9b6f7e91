pub mod geometry {
    use std::f64::consts::{PI, TAU};

    use glam::DVec2;
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    /// 包围盒哨兵值。重置后的包围盒为 `(+BIG, +BIG, -BIG, -BIG)`，
    /// 任何真实坐标都会令其收缩。
    pub const BIG: f64 = 32767.0;

    const MITER_EPS: f64 = 1e-8;

    /// 二维点，内部以 `glam::DVec2` 表示，与原始实现的双精度坐标兼容。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    /// 二维向量，主要用于轮廓偏移量的表达。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 轴对齐包围盒。重置态使用 ±BIG 哨兵，未收缩过的包围盒视为"空"。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct DataBounds {
        min: Point2,
        max: Point2,
    }

    impl DataBounds {
        #[inline]
        pub fn new(min: Point2, max: Point2) -> Self {
            Self { min, max }
        }

        /// 重置态：任何真实点经 `include_point` 都会严格收缩哨兵。
        #[inline]
        pub fn reset() -> Self {
            Self {
                min: Point2::new(BIG, BIG),
                max: Point2::new(-BIG, -BIG),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        pub fn include_point(&mut self, point: Point2) {
            let min_vec = self.min.as_vec2().min(point.as_vec2());
            let max_vec = self.max.as_vec2().max(point.as_vec2());
            self.min = Point2::from_vec(min_vec);
            self.max = Point2::from_vec(max_vec);
        }

        pub fn include_bounds(&mut self, other: &DataBounds) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        #[inline]
        pub fn center(&self) -> Point2 {
            debug_assert!(!self.is_empty());
            let center = (self.min.as_vec2() + self.max.as_vec2()) * 0.5;
            Point2::from_vec(center)
        }
    }

    /// 平面仿射变换 `(a, b, c; d, e, f)`：
    /// `x' = a·x + b·y + c`，`y' = d·x + e·y + f`。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Transform {
        pub a: f64,
        pub b: f64,
        pub c: f64,
        pub d: f64,
        pub e: f64,
        pub f: f64,
    }

    impl Transform {
        pub const IDENTITY: Transform = Transform {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
            e: 1.0,
            f: 0.0,
        };

        #[inline]
        pub fn apply(self, point: Point2) -> Point2 {
            Point2::new(
                self.a * point.x() + self.b * point.y() + self.c,
                self.d * point.x() + self.e * point.y() + self.f,
            )
        }

        /// 在局部坐标系中前置一个平移：先平移 `(dx, dy)`，再施加本变换。
        #[inline]
        pub fn pre_translate(self, dx: f64, dy: f64) -> Transform {
            Transform {
                c: self.a * dx + self.b * dy + self.c,
                f: self.d * dx + self.e * dy + self.f,
                ..self
            }
        }

        /// 矩阵复合：返回"先本变换、后 `other`"的组合。
        pub fn then(self, other: Transform) -> Transform {
            Transform {
                a: other.a * self.a + other.b * self.d,
                b: other.a * self.b + other.b * self.e,
                c: other.a * self.c + other.b * self.f + other.c,
                d: other.d * self.a + other.e * self.d,
                e: other.d * self.b + other.e * self.e,
                f: other.d * self.c + other.e * self.f + other.f,
            }
        }
    }

    /// 路径端头样式。`Flush` 在端点处截平，`Extended` 沿路径方向外延半宽。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum PathEnd {
        Flush,
        Extended,
    }

    impl PathEnd {
        /// GDS 的 pathtype 编码：0 = flush，1 = extended，其余按 flush 处理。
        #[inline]
        pub fn from_code(code: i32) -> Self {
            if code == 1 {
                PathEnd::Extended
            } else {
                PathEnd::Flush
            }
        }

        #[inline]
        pub fn code(self) -> i32 {
            match self {
                PathEnd::Flush => 0,
                PathEnd::Extended => 1,
            }
        }
    }

    #[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
    pub enum GeometryError {
        #[error("path outline needs at least 2 vertices, got {count}")]
        TooFewVertices { count: usize },
        #[error("degenerate miter at vertex {index}: segments reverse direction")]
        DegenerateMiter { index: usize },
    }

    /// 对点序列做 min/max 折叠。空输入返回重置哨兵。
    pub fn bounds_of(points: &[Point2]) -> DataBounds {
        let mut bounds = DataBounds::reset();
        for point in points {
            bounds.include_point(*point);
        }
        bounds
    }

    /// 包围盒的 5 点闭合轮廓，用矩形近似被引用结构的剪影。
    pub fn bounds_outline(bounds: &DataBounds) -> Vec<Point2> {
        let (xmin, ymin) = (bounds.min().x(), bounds.min().y());
        let (xmax, ymax) = (bounds.max().x(), bounds.max().y());
        vec![
            Point2::new(xmin, ymin),
            Point2::new(xmin, ymax),
            Point2::new(xmax, ymax),
            Point2::new(xmax, ymin),
            Point2::new(xmin, ymin),
        ]
    }

    /// 由放置属性合成变换。GDSII 只表达 Y 镜像：
    /// 关于 X 轴反射等价于对 *Y* 分量取反。
    pub fn placement(mag: f64, angle_degrees: f64, origin: Point2, reflected: bool) -> Transform {
        let rad = angle_degrees * PI / 180.0;
        let (sin, cos) = rad.sin_cos();
        let mut transform = Transform {
            a: mag * cos,
            b: -mag * sin,
            c: origin.x(),
            d: mag * sin,
            e: mag * cos,
            f: origin.y(),
        };
        if reflected {
            transform.b = -transform.b;
            transform.e = -transform.e;
        }
        transform
    }

    /// 展开阵列变换：行优先（外层行、内层列），每个单元在 `base` 的
    /// 局部坐标系中平移 `(col·col_step, row·row_step)`。
    pub fn array_transforms(
        base: Transform,
        rows: i32,
        cols: i32,
        row_step: f64,
        col_step: f64,
    ) -> Vec<Transform> {
        let mut transforms = Vec::with_capacity((rows.max(0) * cols.max(0)) as usize);
        for ri in 0..rows {
            for ci in 0..cols {
                let x_offset = f64::from(ci) * col_step;
                let y_offset = f64::from(ri) * row_step;
                transforms.push(base.pre_translate(x_offset, y_offset));
            }
        }
        transforms
    }

    /// 线段方向角，归一化到 [0, 2π)。归一化范围影响斜接角的半角余弦符号，
    /// 必须全程一致。
    fn segment_angle(p1: Point2, p2: Point2) -> f64 {
        let mut angle = (p2.y() - p1.y()).atan2(p2.x() - p1.x());
        if angle < 0.0 {
            angle += TAU;
        }
        angle
    }

    /// 端点处的垂直偏移量。
    fn end_offset(half_width: f64, p1: Point2, p2: Point2) -> Vector2 {
        let alpha = segment_angle(p1, p2);
        Vector2::new(-half_width * alpha.sin(), half_width * alpha.cos())
    }

    /// 内部顶点的斜接偏移量。相邻线段近乎反向（180° 折返）时斜接长度
    /// 发散，返回 None 由调用方报错。
    fn miter_offset(half_width: f64, p1: Point2, p2: Point2, p3: Point2) -> Option<Vector2> {
        let alpha = segment_angle(p1, p2);
        let beta = segment_angle(p2, p3);
        let theta = (alpha + beta + PI) / 2.0;
        let half = ((alpha - beta) / 2.0).cos();
        if half.abs() < MITER_EPS {
            return None;
        }
        let r = half_width / half;
        Some(Vector2::new(r * theta.cos(), r * theta.sin()))
    }

    /// 由路径中心线计算闭合轮廓多边形。`n` 个顶点产出 `2n + 1` 个点，
    /// 首尾重合。半宽为 0 时退化为中心线本身。
    pub fn path_outline(
        vertices: &[Point2],
        half_width: f64,
        ends: PathEnd,
    ) -> Result<Vec<Point2>, GeometryError> {
        if half_width == 0.0 {
            return Ok(vertices.to_vec());
        }
        let n = vertices.len();
        if n < 2 {
            return Err(GeometryError::TooFewVertices { count: n });
        }

        let mut points = vec![Point2::new(0.0, 0.0); 2 * n + 1];

        let delta = end_offset(half_width, vertices[0], vertices[1]);
        let head = vertices[0];
        match ends {
            PathEnd::Flush => {
                points[0] = head.translate(delta);
                points[2 * n - 1] = Point2::new(head.x() - delta.x(), head.y() - delta.y());
            }
            PathEnd::Extended => {
                points[0] = Point2::new(
                    head.x() + delta.x() - delta.y(),
                    head.y() + delta.y() - delta.x(),
                );
                points[2 * n - 1] = Point2::new(
                    head.x() - delta.x() - delta.y(),
                    head.y() - delta.y() - delta.x(),
                );
            }
        }
        points[2 * n] = points[0];

        for i in 1..n - 1 {
            let delta = miter_offset(half_width, vertices[i - 1], vertices[i], vertices[i + 1])
                .ok_or(GeometryError::DegenerateMiter { index: i })?;
            let v = vertices[i];
            points[i] = v.translate(delta);
            points[2 * n - 1 - i] = Point2::new(v.x() - delta.x(), v.y() - delta.y());
        }

        let delta = end_offset(half_width, vertices[n - 2], vertices[n - 1]);
        let tail = vertices[n - 1];
        match ends {
            PathEnd::Flush => {
                points[n - 1] = tail.translate(delta);
                points[n] = Point2::new(tail.x() - delta.x(), tail.y() - delta.y());
            }
            PathEnd::Extended => {
                points[n - 1] = Point2::new(
                    tail.x() + delta.x() + delta.y(),
                    tail.y() + delta.y() + delta.x(),
                );
                points[n] = Point2::new(
                    tail.x() - delta.x() + delta.y(),
                    tail.y() - delta.y() + delta.x(),
                );
            }
        }

        Ok(points)
    }

}

pub mod layer {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    /// RGBA 颜色，分量取值 [0, 1]。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Color {
        pub r: f32,
        pub g: f32,
        pub b: f32,
        pub a: f32,
    }

    impl Color {
        /// 默认图层颜色（浅灰，不透明）。
        pub const LIGHT_GRAY: Color = Color {
            r: 0.753,
            g: 0.753,
            b: 0.753,
            a: 1.0,
        };

        #[inline]
        pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
            Self { r, g, b, a }
        }

        #[inline]
        pub fn opaque(r: f32, g: f32, b: f32) -> Self {
            Self::new(r, g, b, 1.0)
        }
    }

    /// 图层显示属性。编号是不可变身份，其余属性可被文件内容覆盖。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Layer {
        number: i32,
        pub color: Color,
        pub visible: bool,
        pub selectable: bool,
    }

    impl Layer {
        pub fn new(number: i32) -> Self {
            let mut layer = Self {
                number,
                color: Color::LIGHT_GRAY,
                visible: true,
                selectable: true,
            };
            layer.reset_to_default();
            layer
        }

        #[inline]
        pub fn number(&self) -> i32 {
            self.number
        }

        pub fn reset_to_default(&mut self) {
            self.color = Color::LIGHT_GRAY;
            self.visible = true;
            self.selectable = true;
        }
    }

    /// 图层号到显示属性的映射。查询未知图层号时按默认值惰性建表。
    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LayerTable {
        layers: BTreeMap<i32, Layer>,
    }

    impl LayerTable {
        pub fn new() -> Self {
            Self::default()
        }

        /// 返回指定编号的图层，不存在时以默认属性创建。
        pub fn at_number(&mut self, number: i32) -> &mut Layer {
            self.layers.entry(number).or_insert_with(|| Layer::new(number))
        }

        #[inline]
        pub fn get(&self, number: i32) -> Option<&Layer> {
            self.layers.get(&number)
        }

        /// 升序排列的图层编号。
        pub fn numbers(&self) -> Vec<i32> {
            self.layers.keys().copied().collect()
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.layers.len()
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.layers.is_empty()
        }
    }

}

pub mod element {
    use std::cell::{Cell, RefCell};

    use tracing::warn;

    use crate::geometry::{
        self, DataBounds, GeometryError, PathEnd, Point2, Transform,
    };

    /// 引用元素通过该接口向所属库询问目标结构的包围盒。
    /// 实现方负责名称解析与循环引用防护；无法解析、目标为空或
    /// 检测到循环时返回 None，并由实现方记录日志。
    pub trait ReferenceResolver {
        fn reference_bounds(&self, name: &str) -> Option<DataBounds>;
    }

    /// 把所有引用视为未解析的空实现，用于纯图形元素的独立求值。
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NullResolver;

    impl ReferenceResolver for NullResolver {
        fn reference_bounds(&self, _name: &str) -> Option<DataBounds> {
            None
        }
    }

    /// 惰性几何缓存：缺省态在首次查询时计算，突变时整体清空。
    #[derive(Debug, Default)]
    struct GeometryCache {
        outline: RefCell<Option<Vec<Point2>>>,
        bounds: Cell<Option<DataBounds>>,
    }

    impl GeometryCache {
        fn clear(&self) {
            self.outline.borrow_mut().take();
            self.bounds.set(None);
        }

        fn cached_outline(&self) -> Option<Vec<Point2>> {
            self.outline.borrow().clone()
        }

        fn store_outline(&self, points: &[Point2]) {
            *self.outline.borrow_mut() = Some(points.to_vec());
        }
    }

    /// 闭合多边形元素。
    #[derive(Debug)]
    pub struct Boundary {
        vertices: Vec<Point2>,
        key_number: i32,
        layer_number: i32,
        datatype: i32,
        cache: GeometryCache,
    }

    impl Boundary {
        pub fn new(vertices: Vec<Point2>, layer_number: i32, datatype: i32) -> Self {
            Self {
                vertices,
                key_number: 0,
                layer_number,
                datatype,
                cache: GeometryCache::default(),
            }
        }

        #[inline]
        pub fn layer_number(&self) -> i32 {
            self.layer_number
        }

        #[inline]
        pub fn datatype(&self) -> i32 {
            self.datatype
        }
    }

    /// 开放折线元素，按宽度与端头样式偏移出闭合轮廓。
    #[derive(Debug)]
    pub struct Path {
        vertices: Vec<Point2>,
        key_number: i32,
        layer_number: i32,
        datatype: i32,
        width: f64,
        ends: PathEnd,
        cache: GeometryCache,
    }

    impl Path {
        pub fn new(
            vertices: Vec<Point2>,
            width: f64,
            ends: PathEnd,
            layer_number: i32,
            datatype: i32,
        ) -> Self {
            Self {
                vertices,
                key_number: 0,
                layer_number,
                datatype,
                width,
                ends,
                cache: GeometryCache::default(),
            }
        }

        #[inline]
        pub fn layer_number(&self) -> i32 {
            self.layer_number
        }

        #[inline]
        pub fn datatype(&self) -> i32 {
            self.datatype
        }

        #[inline]
        pub fn width(&self) -> f64 {
            self.width
        }

        #[inline]
        pub fn half_width(&self) -> f64 {
            self.width / 2.0
        }

        #[inline]
        pub fn ends(&self) -> PathEnd {
            self.ends
        }

        fn compute_outline(&self) -> Result<Vec<Point2>, GeometryError> {
            geometry::path_outline(&self.vertices, self.half_width(), self.ends)
        }
    }

    /// 引用元素共享的放置状态。原点取第一个顶点；变换按需合成并缓存。
    #[derive(Debug)]
    pub struct Placement {
        vertices: Vec<Point2>,
        key_number: i32,
        reference_name: String,
        mag: f64,
        angle: f64,
        reflected: bool,
        transform: Cell<Option<Transform>>,
    }

    impl Placement {
        fn new(vertices: Vec<Point2>, reference_name: &str) -> Self {
            Self {
                vertices,
                key_number: 0,
                reference_name: reference_name.to_uppercase(),
                mag: 1.0,
                angle: 0.0,
                reflected: false,
                transform: Cell::new(None),
            }
        }

        #[inline]
        pub fn reference_name(&self) -> &str {
            &self.reference_name
        }

        #[inline]
        pub fn mag(&self) -> f64 {
            self.mag
        }

        /// 旋转角，单位为度。
        #[inline]
        pub fn angle(&self) -> f64 {
            self.angle
        }

        #[inline]
        pub fn reflected(&self) -> bool {
            self.reflected
        }

        /// 放置原点，即第一个顶点。顶点缺失时引用不产生几何。
        #[inline]
        pub fn origin(&self) -> Option<Point2> {
            self.vertices.first().copied()
        }

        pub fn transform(&self) -> Option<Transform> {
            if let Some(cached) = self.transform.get() {
                return Some(cached);
            }
            let origin = self.origin()?;
            let transform = geometry::placement(self.mag, self.angle, origin, self.reflected);
            self.transform.set(Some(transform));
            Some(transform)
        }

        fn set_vertices(&mut self, vertices: Vec<Point2>) {
            self.vertices = vertices;
            self.transform.set(None);
        }

        fn set_attributes(&mut self, mag: f64, angle: f64, reflected: bool) {
            self.mag = mag;
            self.angle = angle;
            self.reflected = reflected;
            self.transform.set(None);
        }

        fn set_reference_name(&mut self, name: &str) {
            self.reference_name = name.to_uppercase();
        }

        /// 把目标包围盒的矩形轮廓经 `transform` 映射后追加到 `out`。
        fn append_mapped_box(transform: Transform, bounds: &DataBounds, out: &mut Vec<Point2>) {
            for point in geometry::bounds_outline(bounds) {
                out.push(transform.apply(point));
            }
        }

        fn resolve(&self, resolver: &dyn ReferenceResolver) -> Option<DataBounds> {
            if self.reference_name.is_empty() {
                warn!("reference element has empty reference name");
                return None;
            }
            resolver.reference_bounds(&self.reference_name)
        }
    }

    /// 单一放置引用。轮廓是被引用结构包围盒经自身变换映射出的矩形。
    #[derive(Debug)]
    pub struct Sref {
        placement: Placement,
        cache: GeometryCache,
    }

    impl Sref {
        pub fn new(vertices: Vec<Point2>, reference_name: &str) -> Self {
            Self {
                placement: Placement::new(vertices, reference_name),
                cache: GeometryCache::default(),
            }
        }

        #[inline]
        pub fn reference_name(&self) -> &str {
            self.placement.reference_name()
        }

        #[inline]
        pub fn mag(&self) -> f64 {
            self.placement.mag()
        }

        #[inline]
        pub fn angle(&self) -> f64 {
            self.placement.angle()
        }

        #[inline]
        pub fn reflected(&self) -> bool {
            self.placement.reflected()
        }

        #[inline]
        pub fn origin(&self) -> Option<Point2> {
            self.placement.origin()
        }

        #[inline]
        pub fn transform(&self) -> Option<Transform> {
            self.placement.transform()
        }

        /// 更新放置属性并清空派生几何。
        pub fn set_placement(&mut self, mag: f64, angle: f64, reflected: bool) {
            self.placement.set_attributes(mag, angle, reflected);
            self.cache.clear();
        }

        pub fn set_reference_name(&mut self, name: &str) {
            self.placement.set_reference_name(name);
            self.cache.clear();
        }

        fn compute_outline(&self, resolver: &dyn ReferenceResolver) -> Vec<Point2> {
            let Some(bounds) = self.placement.resolve(resolver) else {
                return Vec::new();
            };
            let Some(transform) = self.placement.transform() else {
                warn!(
                    reference = %self.reference_name(),
                    "reference element has no origin vertex"
                );
                return Vec::new();
            };
            let mut points = Vec::with_capacity(5);
            Placement::append_mapped_box(transform, &bounds, &mut points);
            points
        }
    }

    /// 阵列形状描述。行列数必须不小于 1。
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct ArrayShape {
        pub rows: i32,
        pub cols: i32,
        pub row_step: f64,
        pub col_step: f64,
    }

    impl ArrayShape {
        /// 行列数有效时构造，否则返回 None（配置错误，调用方记录日志）。
        pub fn checked(rows: i32, cols: i32, row_step: f64, col_step: f64) -> Option<Self> {
            if rows < 1 || cols < 1 {
                return None;
            }
            Some(Self {
                rows,
                cols,
                row_step,
                col_step,
            })
        }

        #[inline]
        pub fn cell_count(&self) -> usize {
            (self.rows * self.cols) as usize
        }
    }

    /// 阵列放置引用。缺失形状描述时不产生任何阵列单元。
    /// 轮廓是每个单元各一个映射矩形的点序列拼接，消费方不能假定
    /// 单一闭环。
    #[derive(Debug)]
    pub struct Aref {
        placement: Placement,
        shape: Option<ArrayShape>,
        transforms: RefCell<Option<Vec<Transform>>>,
        cache: GeometryCache,
    }

    impl Aref {
        pub fn new(vertices: Vec<Point2>, reference_name: &str, shape: Option<ArrayShape>) -> Self {
            Self {
                placement: Placement::new(vertices, reference_name),
                shape,
                transforms: RefCell::new(None),
                cache: GeometryCache::default(),
            }
        }

        #[inline]
        pub fn reference_name(&self) -> &str {
            self.placement.reference_name()
        }

        #[inline]
        pub fn shape(&self) -> Option<ArrayShape> {
            self.shape
        }

        #[inline]
        pub fn origin(&self) -> Option<Point2> {
            self.placement.origin()
        }

        #[inline]
        pub fn base_transform(&self) -> Option<Transform> {
            self.placement.transform()
        }

        pub fn set_placement(&mut self, mag: f64, angle: f64, reflected: bool) {
            self.placement.set_attributes(mag, angle, reflected);
            self.invalidate();
        }

        pub fn set_reference_name(&mut self, name: &str) {
            self.placement.set_reference_name(name);
            self.invalidate();
        }

        pub fn set_shape(&mut self, shape: Option<ArrayShape>) {
            self.shape = shape;
            self.invalidate();
        }

        fn invalidate(&self) {
            self.transforms.borrow_mut().take();
            self.cache.clear();
        }

        /// 行优先展开的阵列单元变换。形状或原点缺失时为空。
        pub fn transforms(&self) -> Vec<Transform> {
            if let Some(cached) = self.transforms.borrow().as_ref() {
                return cached.clone();
            }
            let expanded = match (self.shape, self.placement.transform()) {
                (Some(shape), Some(base)) => geometry::array_transforms(
                    base,
                    shape.rows,
                    shape.cols,
                    shape.row_step,
                    shape.col_step,
                ),
                _ => Vec::new(),
            };
            *self.transforms.borrow_mut() = Some(expanded.clone());
            expanded
        }

        fn compute_outline(&self, resolver: &dyn ReferenceResolver) -> Vec<Point2> {
            let Some(bounds) = self.placement.resolve(resolver) else {
                return Vec::new();
            };
            let transforms = self.transforms();
            let mut points = Vec::with_capacity(transforms.len() * 5);
            for transform in transforms {
                Placement::append_mapped_box(transform, &bounds, &mut points);
            }
            points
        }
    }

    /// 结构内的几何实体。Boundary/Path 为图形元素，Sref/Aref 为引用元素。
    #[derive(Debug)]
    pub enum Element {
        Boundary(Boundary),
        Path(Path),
        Sref(Sref),
        Aref(Aref),
    }

    impl Element {
        pub fn vertices(&self) -> &[Point2] {
            match self {
                Element::Boundary(boundary) => &boundary.vertices,
                Element::Path(path) => &path.vertices,
                Element::Sref(sref) => &sref.placement.vertices,
                Element::Aref(aref) => &aref.placement.vertices,
            }
        }

        pub fn key_number(&self) -> i32 {
            match self {
                Element::Boundary(boundary) => boundary.key_number,
                Element::Path(path) => path.key_number,
                Element::Sref(sref) => sref.placement.key_number,
                Element::Aref(aref) => aref.placement.key_number,
            }
        }

        pub fn set_key_number(&mut self, key_number: i32) {
            match self {
                Element::Boundary(boundary) => boundary.key_number = key_number,
                Element::Path(path) => path.key_number = key_number,
                Element::Sref(sref) => sref.placement.key_number = key_number,
                Element::Aref(aref) => aref.placement.key_number = key_number,
            }
        }

        /// 图形元素的图层号；引用元素没有图层。
        pub fn layer_number(&self) -> Option<i32> {
            match self {
                Element::Boundary(boundary) => Some(boundary.layer_number),
                Element::Path(path) => Some(path.layer_number),
                Element::Sref(_) | Element::Aref(_) => None,
            }
        }

        /// 替换顶点并立即失效全部派生几何。
        pub fn set_vertices(&mut self, vertices: Vec<Point2>) {
            match self {
                Element::Boundary(boundary) => {
                    boundary.vertices = vertices;
                    boundary.cache.clear();
                }
                Element::Path(path) => {
                    path.vertices = vertices;
                    path.cache.clear();
                }
                Element::Sref(sref) => {
                    sref.placement.set_vertices(vertices);
                    sref.cache.clear();
                }
                Element::Aref(aref) => {
                    aref.placement.set_vertices(vertices);
                    aref.invalidate();
                }
            }
        }

        fn cache(&self) -> &GeometryCache {
            match self {
                Element::Boundary(boundary) => &boundary.cache,
                Element::Path(path) => &path.cache,
                Element::Sref(sref) => &sref.cache,
                Element::Aref(aref) => &aref.cache,
            }
        }

        /// 元素的轮廓点序列。引用解析失败降级为空序列（由解析方记录日志）；
        /// 路径斜接退化则显式报错而不是返回错误几何。
        pub fn outline(
            &self,
            resolver: &dyn ReferenceResolver,
        ) -> Result<Vec<Point2>, GeometryError> {
            if let Some(cached) = self.cache().cached_outline() {
                return Ok(cached);
            }
            let points = match self {
                Element::Boundary(boundary) => boundary.vertices.clone(),
                Element::Path(path) => path.compute_outline()?,
                Element::Sref(sref) => sref.compute_outline(resolver),
                Element::Aref(aref) => aref.compute_outline(resolver),
            };
            self.cache().store_outline(&points);
            Ok(points)
        }

        /// 轮廓点的包围盒。无几何的元素返回重置哨兵（空）。
        pub fn data_bounds(
            &self,
            resolver: &dyn ReferenceResolver,
        ) -> Result<DataBounds, GeometryError> {
            if let Some(cached) = self.cache().bounds.get() {
                return Ok(cached);
            }
            let outline = self.outline(resolver)?;
            let bounds = geometry::bounds_of(&outline);
            self.cache().bounds.set(Some(bounds));
            Ok(bounds)
        }
    }

    #[cfg(test)]
    mod tests {
        use std::collections::HashMap;

        use super::*;
        use crate::geometry::{bounds_of, PathEnd};

        struct MapResolver(HashMap<String, DataBounds>);

        impl MapResolver {
            fn with(name: &str, bounds: DataBounds) -> Self {
                let mut map = HashMap::new();
                map.insert(name.to_string(), bounds);
                Self(map)
            }
        }

        impl ReferenceResolver for MapResolver {
            fn reference_bounds(&self, name: &str) -> Option<DataBounds> {
                self.0.get(name).copied()
            }
        }

        fn unit_square() -> DataBounds {
            bounds_of(&[Point2::new(0.0, 0.0), Point2::new(10.0, 10.0)])
        }

        #[test]
        fn boundary_bounds_cover_vertices() {
            let element = Element::Boundary(Boundary::new(
                vec![
                    Point2::new(0.0, 0.0),
                    Point2::new(0.0, 10.0),
                    Point2::new(10.0, 10.0),
                    Point2::new(10.0, 0.0),
                ],
                1,
                0,
            ));
            let bounds = element.data_bounds(&NullResolver).expect("包围盒");
            assert_eq!(bounds.min(), Point2::new(0.0, 0.0));
            assert_eq!(bounds.max(), Point2::new(10.0, 10.0));
        }

        #[test]
        fn set_vertices_invalidates_cached_bounds() {
            let mut element = Element::Boundary(Boundary::new(
                vec![Point2::new(0.0, 0.0), Point2::new(1.0, 1.0)],
                1,
                0,
            ));
            let first = element.data_bounds(&NullResolver).expect("包围盒");
            assert_eq!(first.max(), Point2::new(1.0, 1.0));

            element.set_vertices(vec![Point2::new(0.0, 0.0), Point2::new(5.0, 2.0)]);
            let second = element.data_bounds(&NullResolver).expect("包围盒");
            assert_eq!(second.max(), Point2::new(5.0, 2.0));
        }

        #[test]
        fn path_miter_failure_propagates() {
            let element = Element::Path(Path::new(
                vec![
                    Point2::new(0.0, 0.0),
                    Point2::new(10.0, 0.0),
                    Point2::new(0.0, 0.0),
                ],
                4.0,
                PathEnd::Flush,
                1,
                0,
            ));
            let err = element.outline(&NullResolver).unwrap_err();
            assert_eq!(err, GeometryError::DegenerateMiter { index: 1 });
        }

        #[test]
        fn unresolved_sref_yields_empty_outline() {
            let element = Element::Sref(Sref::new(vec![Point2::new(0.0, 0.0)], "MISSING"));
            let outline = element.outline(&NullResolver).expect("轮廓");
            assert!(outline.is_empty());
            assert!(element.data_bounds(&NullResolver).expect("包围盒").is_empty());
        }

        #[test]
        fn sref_maps_target_box_through_transform() {
            let mut sref = Sref::new(vec![Point2::new(100.0, 50.0)], "cell_a");
            // sname 归一化为大写
            assert_eq!(sref.reference_name(), "CELL_A");
            sref.set_placement(1.0, 0.0, false);

            let resolver = MapResolver::with("CELL_A", unit_square());
            let element = Element::Sref(sref);
            let outline = element.outline(&resolver).expect("轮廓");
            assert_eq!(outline.len(), 5);
            let bounds = element.data_bounds(&resolver).expect("包围盒");
            assert_eq!(bounds.min(), Point2::new(100.0, 50.0));
            assert_eq!(bounds.max(), Point2::new(110.0, 60.0));
        }

        #[test]
        fn sref_attribute_change_invalidates_outline() {
            let resolver = MapResolver::with("CELL_A", unit_square());
            let mut element = Element::Sref(Sref::new(vec![Point2::new(0.0, 0.0)], "CELL_A"));

            let before = element.data_bounds(&resolver).expect("包围盒");
            assert_eq!(before.max(), Point2::new(10.0, 10.0));

            if let Element::Sref(sref) = &mut element {
                sref.set_placement(2.0, 0.0, false);
            }
            let after = element.data_bounds(&resolver).expect("包围盒");
            assert_eq!(after.max(), Point2::new(20.0, 20.0));
        }

        #[test]
        fn aref_concatenates_one_box_per_cell() {
            let shape = ArrayShape::checked(2, 3, 5.0, 2.0).expect("阵列形状");
            let aref = Aref::new(vec![Point2::new(0.0, 0.0)], "CELL_A", Some(shape));
            assert_eq!(aref.transforms().len(), 6);

            let resolver = MapResolver::with("CELL_A", unit_square());
            let element = Element::Aref(aref);
            let outline = element.outline(&resolver).expect("轮廓");
            assert_eq!(outline.len(), 6 * 5);

            let bounds = element.data_bounds(&resolver).expect("包围盒");
            // 2 列步距 + 10 宽；1 行步距 + 10 高
            assert_eq!(bounds.max(), Point2::new(14.0, 15.0));
        }

        #[test]
        fn aref_without_shape_has_no_cells() {
            let aref = Aref::new(vec![Point2::new(0.0, 0.0)], "CELL_A", None);
            assert!(aref.transforms().is_empty());

            let resolver = MapResolver::with("CELL_A", unit_square());
            let element = Element::Aref(aref);
            assert!(element.outline(&resolver).expect("轮廓").is_empty());
        }

        #[test]
        fn invalid_array_counts_are_rejected() {
            assert!(ArrayShape::checked(0, 3, 1.0, 1.0).is_none());
            assert!(ArrayShape::checked(2, -1, 1.0, 1.0).is_none());
        }

        #[test]
        fn empty_reference_name_yields_no_geometry() {
            let resolver = MapResolver::with("", unit_square());
            let element = Element::Sref(Sref::new(vec![Point2::new(0.0, 0.0)], ""));
            assert!(element.outline(&resolver).expect("轮廓").is_empty());
        }
    }
}
